use crate::catalog::ConfigSource;
use crate::model::RunResult;
use crate::registry;
use crate::runtime::ConnectorRuntime;
use crate::scheduler::Scheduler;
use collector_core::{Config, Result};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct App {
    scheduler: Arc<Scheduler>,
    catalog: Arc<dyn ConfigSource>,
}

impl App {
    #[instrument(skip(config))]
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing collector");

        let cache = registry::build_cache(&config.cache).await?;
        let output = registry::build_output(&config.output).await?;
        let secrets = registry::build_secrets(&config.secrets)?;
        let catalog = registry::build_catalog(&config.catalog)?;

        let runtime = Arc::new(ConnectorRuntime::new(
            Arc::clone(&cache),
            output,
            config.collection.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            cache,
            runtime,
            Arc::clone(&catalog),
            secrets,
            config,
        ));

        Ok(Self { scheduler, catalog })
    }

    pub async fn run_daemon(&self) -> Result<()> {
        Arc::clone(&self.scheduler).run_daemon().await
    }

    pub async fn run_once(&self) -> Result<Vec<RunResult>> {
        self.scheduler.run_once().await
    }

    pub async fn run_tick(&self) -> Result<Vec<RunResult>> {
        self.scheduler.run_tick().await
    }

    pub async fn check(&self) -> Result<()> {
        // Surface catalog problems before per-instance validation.
        let instances = self.catalog.load().await?;
        info!(instances = instances.len(), "Catalog loaded");
        self.scheduler.check().await
    }
}

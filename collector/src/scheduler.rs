use crate::cache::{Cache, Expected};
use crate::catalog::{ConfigSource, InstanceConfig};
use crate::model::{ConnectorIdentity, Outcome, RunMarker, RunResult};
use crate::registry;
use crate::runtime::ConnectorRuntime;
use crate::secrets::SecretSource;
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use chrono::{DateTime, Utc};
use collector_core::backoff::trigger_backoff;
use collector_core::{Config, Error, Result};
use metrics::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Per-instance scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Running,
    Backoff,
    Disabled,
}

struct InstanceState {
    instance: InstanceConfig,
    status: Status,
    next_due: DateTime<Utc>,
    backoff: ExponentialBackoff<backoff::SystemClock>,
}

/// Owns the set of configured connector instances: triggers runs on their
/// intervals, enforces single-flight execution through a cache-backed
/// marker, applies backoff after transient failures, and disables instances
/// that fail permanently until their configuration changes.
pub struct Scheduler {
    cache: Arc<dyn Cache>,
    runtime: Arc<ConnectorRuntime>,
    catalog: Arc<dyn ConfigSource>,
    secrets: Arc<dyn SecretSource>,
    config: Config,
    workers: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        cache: Arc<dyn Cache>,
        runtime: Arc<ConnectorRuntime>,
        catalog: Arc<dyn ConfigSource>,
        secrets: Arc<dyn SecretSource>,
        config: Config,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.scheduler.workers));
        Self {
            cache,
            runtime,
            catalog,
            secrets,
            config,
            workers,
        }
    }

    /// Long-running driver: trigger due instances until interrupted, then
    /// wait out in-flight runs for the configured grace period.
    pub async fn run_daemon(self: Arc<Self>) -> Result<()> {
        info!(
            workers = self.config.scheduler.workers,
            refresh_secs = self.config.catalog.refresh_interval_secs,
            "Scheduler started"
        );

        let mut states: HashMap<String, InstanceState> = HashMap::new();
        let mut running: JoinSet<RunResult> = JoinSet::new();
        let mut task_refs: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut next_refresh = Instant::now();
        let tick = Duration::from_millis(self.config.scheduler.tick_interval_ms);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            if Instant::now() >= next_refresh {
                match self.catalog.load().await {
                    Ok(instances) => {
                        self.reconcile(&mut states, instances).await;
                        debug!(instances = states.len(), "Instance catalog refreshed");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to refresh instance catalog, keeping previous")
                    }
                }
                next_refresh = Instant::now()
                    + Duration::from_secs(self.config.catalog.refresh_interval_secs);
            }

            let now = Utc::now();
            for (reference, state) in states.iter_mut() {
                let due = matches!(state.status, Status::Idle | Status::Backoff)
                    && now >= state.next_due
                    && !state.instance.disabled;
                if !due {
                    continue;
                }

                state.status = Status::Running;
                counter!("collector_runs_scheduled").increment(1);

                let scheduler = Arc::clone(&self);
                let instance = state.instance.clone();
                let handle = running.spawn(async move { scheduler.execute_run(instance).await });
                task_refs.insert(handle.id(), reference.clone());
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no further runs will start");
                    break;
                }
                Some(joined) = running.join_next_with_id(), if !running.is_empty() => {
                    match joined {
                        Ok((id, result)) => {
                            if let Some(reference) = task_refs.remove(&id) {
                                self.note_completion(&mut states, &reference, result);
                            }
                        }
                        Err(join_error) => {
                            // A panicking run must not take the daemon down
                            // or wedge its instance.
                            error!(error = %join_error, "Connector run aborted abnormally");
                            if let Some(reference) = task_refs.remove(&join_error.id()) {
                                if let Some(state) = states.get_mut(&reference) {
                                    state.status = Status::Idle;
                                    state.next_due = Utc::now()
                                        + chrono::Duration::seconds(
                                            self.config.scheduler.backoff_base_secs as i64,
                                        );
                                }
                            }
                        }
                    }
                }
                _ = tokio::time::sleep(tick) => {}
            }
        }

        // Advisory shutdown: let in-flight runs reach a consistent
        // checkpoint, bounded by the grace period.
        let grace = Duration::from_secs(self.config.scheduler.shutdown_grace_secs);
        info!(in_flight = running.len(), grace_secs = grace.as_secs(), "Draining in-flight runs");

        let drain = async {
            while let Some(joined) = running.join_next_with_id().await {
                if let Ok((id, result)) = joined {
                    if let Some(reference) = task_refs.remove(&id) {
                        debug!(instance = %reference, outcome = result.outcome.as_str(), "Run finished during drain");
                    }
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Grace period elapsed, aborting remaining runs");
            running.abort_all();
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Single-shot driver: run every enabled instance once. The caller maps
    /// permanent failures to a non-zero exit status.
    pub async fn run_once(self: &Arc<Self>) -> Result<Vec<RunResult>> {
        let instances = self.catalog.load().await?;
        info!(instances = instances.len(), "Running all enabled instances once");

        let mut tasks = JoinSet::new();
        for instance in instances.into_iter().filter(|i| !i.disabled) {
            let scheduler = Arc::clone(self);
            tasks.spawn(async move { scheduler.execute_run(instance).await });
        }

        self.collect_results(tasks).await
    }

    /// One scheduling pass for cron or serverless drivers. Due-ness is
    /// decided from last-run times in the cache, so duplicate or concurrent
    /// invocations converge; the run marker breaks any remaining ties.
    pub async fn run_tick(self: &Arc<Self>) -> Result<Vec<RunResult>> {
        let instances = self.catalog.load().await?;

        let mut tasks = JoinSet::new();
        for instance in instances.into_iter().filter(|i| !i.disabled) {
            if !self.is_due(&instance).await {
                debug!(instance = %instance.identity(), "Not due yet, skipping");
                continue;
            }
            let scheduler = Arc::clone(self);
            tasks.spawn(async move { scheduler.execute_run(instance).await });
        }

        self.collect_results(tasks).await
    }

    /// Validate the catalog without collecting: connector kinds must
    /// resolve and secrets must be present.
    pub async fn check(&self) -> Result<()> {
        let instances = self.catalog.load().await?;
        let mut failures = 0usize;

        match self.cache.list("pointer/").await {
            Ok(pointers) => info!(checkpoints = pointers.len(), "Cache reachable"),
            Err(e) => {
                error!(error = %e, "Cache backend is unreachable");
                failures += 1;
            }
        }

        for instance in &instances {
            let identity = instance.identity();

            let secret = match &instance.secret {
                Some(identifier) => match self.secrets.resolve(identifier).await {
                    Ok(secret) => Some(secret),
                    Err(e) => {
                        error!(instance = %identity, error = %e, "Secret is not resolvable");
                        failures += 1;
                        continue;
                    }
                },
                None => None,
            };

            match registry::build_source(instance, secret) {
                Ok(_) => info!(instance = %identity, disabled = instance.disabled, "Instance OK"),
                Err(e) => {
                    error!(instance = %identity, error = %e, "Instance configuration invalid");
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            return Err(Error::Config(format!(
                "{failures} of {} instances failed validation",
                instances.len()
            )));
        }
        Ok(())
    }

    async fn collect_results(&self, mut tasks: JoinSet<RunResult>) -> Result<Vec<RunResult>> {
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    info!(
                        instance = %result.identity,
                        outcome = result.outcome.as_str(),
                        records = result.records,
                        duration_ms = result.duration.as_millis() as u64,
                        error = result.error.as_deref().unwrap_or(""),
                        "Run finished"
                    );
                    results.push(result);
                }
                Err(e) => error!(error = %e, "Connector run aborted abnormally"),
            }
        }
        Ok(results)
    }

    /// One complete guarded run: worker permit, single-flight marker,
    /// secret resolution, source construction, collection, bookkeeping.
    async fn execute_run(self: Arc<Self>, instance: InstanceConfig) -> RunResult {
        let identity = instance.identity();
        let started = Instant::now();

        let _permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return RunResult::failure(
                    identity,
                    Outcome::TransientFailure,
                    0,
                    started.elapsed(),
                    "worker pool closed",
                )
            }
        };

        let marker_version = match self.acquire_marker(&identity).await {
            Ok(version) => version,
            Err(Error::Conflict(_)) => {
                // Another worker, possibly in another process, holds this
                // instance. Normal under overlapping invocations.
                debug!(instance = %identity, "Run already in progress elsewhere, yielding");
                return RunResult::failure(
                    identity,
                    Outcome::TransientFailure,
                    0,
                    started.elapsed(),
                    "run already in progress",
                );
            }
            Err(e) => {
                warn!(instance = %identity, error = %e, "Could not acquire run marker");
                return RunResult::failure(
                    identity,
                    Outcome::TransientFailure,
                    0,
                    started.elapsed(),
                    e.to_string(),
                );
            }
        };

        let secret = match &instance.secret {
            Some(identifier) => match self.secrets.resolve(identifier).await {
                Ok(secret) => Some(secret),
                Err(e) => {
                    self.release_marker(&identity, marker_version).await;
                    return RunResult::failure(
                        identity,
                        Outcome::PermanentFailure,
                        0,
                        started.elapsed(),
                        e.to_string(),
                    );
                }
            },
            None => None,
        };

        let source = match registry::build_source(&instance, secret) {
            Ok(source) => source,
            Err(e) => {
                self.release_marker(&identity, marker_version).await;
                return RunResult::failure(
                    identity,
                    Outcome::PermanentFailure,
                    0,
                    started.elapsed(),
                    e.to_string(),
                );
            }
        };

        // Hard stop well past the soft run budget; a run cut off here has
        // not advanced its pointer, so nothing is lost.
        let hard_timeout = Duration::from_secs(
            self.config.collection.run_budget_secs.saturating_mul(2).max(60),
        );
        let result = match tokio::time::timeout(
            hard_timeout,
            self.runtime.collect(&instance, source),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(instance = %identity, "Run exceeded its hard timeout, aborted");
                RunResult::failure(
                    identity.clone(),
                    Outcome::TransientFailure,
                    0,
                    started.elapsed(),
                    "run exceeded hard timeout",
                )
            }
        };

        self.record_last_run(&identity).await;
        self.release_marker(&identity, marker_version).await;

        result
    }

    async fn acquire_marker(&self, identity: &ConnectorIdentity) -> Result<u64> {
        let key = identity.marker_key();
        let ttl = Duration::from_secs(self.config.scheduler.marker_ttl_secs);
        let marker = RunMarker::new(ttl);
        let encoded = serde_json::to_string(&marker)?;

        match self.cache.get(&key).await? {
            None => self.cache.put(&key, &encoded, Expected::Absent).await,
            Some(entry) => {
                // An unreadable marker counts as abandoned.
                let expired = serde_json::from_str::<RunMarker>(&entry.value)
                    .map(|existing| existing.is_expired(Utc::now()))
                    .unwrap_or(true);
                if expired {
                    warn!(key, "Taking over an expired run marker");
                    self.cache
                        .put(&key, &encoded, Expected::Version(entry.version))
                        .await
                } else {
                    Err(Error::Conflict(key))
                }
            }
        }
    }

    async fn release_marker(&self, identity: &ConnectorIdentity, version: u64) {
        let key = identity.marker_key();
        if let Err(e) = self.cache.delete(&key, Expected::Version(version)).await {
            // The marker may have expired and been taken over mid-run; the
            // new holder owns it now.
            warn!(key, error = %e, "Failed to release run marker");
        }
    }

    async fn record_last_run(&self, identity: &ConnectorIdentity) {
        let key = identity.last_run_key();
        if let Err(e) = self
            .cache
            .put(&key, &Utc::now().to_rfc3339(), Expected::Any)
            .await
        {
            warn!(key, error = %e, "Failed to record last run time");
        }
    }

    async fn is_due(&self, instance: &InstanceConfig) -> bool {
        let key = instance.identity().last_run_key();
        let frequency = instance.frequency(self.config.scheduler.default_frequency_secs);

        match self.cache.get(&key).await {
            Ok(Some(entry)) => match DateTime::parse_from_rfc3339(&entry.value) {
                Ok(last) => {
                    let elapsed = Utc::now() - last.with_timezone(&Utc);
                    elapsed >= chrono::Duration::from_std(frequency).unwrap_or_else(|_| chrono::Duration::zero())
                }
                Err(_) => true,
            },
            Ok(None) => true,
            // If the cache is down the marker check will stop a duplicate.
            Err(_) => true,
        }
    }

    async fn reconcile(
        &self,
        states: &mut HashMap<String, InstanceState>,
        instances: Vec<InstanceConfig>,
    ) {
        let mut seen = HashSet::new();

        for instance in instances {
            let reference = instance.identity().reference();
            seen.insert(reference.clone());

            match states.get_mut(&reference) {
                Some(state) => {
                    if state.instance != instance {
                        info!(instance = %reference, "Instance configuration changed");
                        // A configuration change re-arms a disabled instance.
                        if state.status == Status::Disabled {
                            state.status = Status::Idle;
                            state.next_due = Utc::now();
                        }
                        state.instance = instance;
                    }
                }
                None => {
                    let next_due = self.initial_due(&instance).await;
                    states.insert(
                        reference,
                        InstanceState {
                            status: Status::Idle,
                            next_due,
                            backoff: trigger_backoff(
                                self.config.scheduler.backoff_base_secs,
                                self.config.scheduler.backoff_max_secs,
                            ),
                            instance,
                        },
                    );
                }
            }
        }

        // Instances removed from the catalog stop being scheduled; an
        // in-flight run just finishes without a state to report into.
        states.retain(|reference, _| seen.contains(reference));

        gauge!("collector_instances").set(states.len() as f64);
    }

    /// First sight of an instance: honor last-run bookkeeping left by other
    /// schedulers rather than triggering immediately.
    async fn initial_due(&self, instance: &InstanceConfig) -> DateTime<Utc> {
        let frequency = instance.frequency(self.config.scheduler.default_frequency_secs);
        match self.cache.get(&instance.identity().last_run_key()).await {
            Ok(Some(entry)) => match DateTime::parse_from_rfc3339(&entry.value) {
                Ok(last) => {
                    last.with_timezone(&Utc)
                        + chrono::Duration::from_std(frequency).unwrap_or_else(|_| chrono::Duration::zero())
                }
                Err(_) => Utc::now(),
            },
            _ => Utc::now(),
        }
    }

    fn note_completion(
        &self,
        states: &mut HashMap<String, InstanceState>,
        reference: &str,
        result: RunResult,
    ) {
        let Some(state) = states.get_mut(reference) else {
            // Removed from the catalog while running.
            return;
        };
        let frequency = state
            .instance
            .frequency(self.config.scheduler.default_frequency_secs);

        match result.outcome {
            Outcome::Success => {
                debug!(
                    instance = %reference,
                    records = result.records,
                    "Run succeeded"
                );
                state.status = Status::Idle;
                state.backoff = trigger_backoff(
                    self.config.scheduler.backoff_base_secs,
                    self.config.scheduler.backoff_max_secs,
                );
                state.next_due =
                    Utc::now() + chrono::Duration::from_std(frequency).unwrap_or_else(|_| chrono::Duration::zero());
            }
            Outcome::TransientFailure => {
                let delay = state.backoff.next_backoff().unwrap_or(Duration::from_secs(
                    self.config.scheduler.backoff_max_secs,
                ));
                warn!(
                    instance = %reference,
                    error = result.error.as_deref().unwrap_or(""),
                    retry_in_secs = delay.as_secs(),
                    "Run failed transiently, backing off"
                );
                state.status = Status::Backoff;
                state.next_due =
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            }
            Outcome::PermanentFailure => {
                error!(
                    instance = %reference,
                    error = result.error.as_deref().unwrap_or(""),
                    "Run failed permanently, instance disabled until reconfigured"
                );
                state.status = Status::Disabled;
            }
        }
    }
}

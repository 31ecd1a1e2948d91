use crate::cache::{Cache, Expected};
use crate::catalog::InstanceConfig;
use crate::model::{CollectionOrder, ConnectorIdentity, Outcome, Pointer, RunResult};
use crate::output::Output;
use crate::sources::LogSource;
use crate::transform::{self, Transform};
use chrono::Utc;
use collector_core::backoff::retry_with_backoff;
use collector_core::config::CollectionConfig;
use collector_core::{Error, Result};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Drives the per-connector collection state machine: read the pointer,
/// page through the source, filter the boundary overlap, flush batches,
/// then advance the pointer with a conditional write.
///
/// The runtime is stateless between runs; every run gets a fresh source and
/// everything persistent lives in the cache.
pub struct ConnectorRuntime {
    cache: Arc<dyn Cache>,
    output: Arc<dyn Output>,
    config: CollectionConfig,
}

impl ConnectorRuntime {
    pub fn new(cache: Arc<dyn Cache>, output: Arc<dyn Output>, config: CollectionConfig) -> Self {
        Self {
            cache,
            output,
            config,
        }
    }

    /// Execute one run-cycle. All failures are converted into the returned
    /// result; the scheduler decides what happens to the instance next.
    #[instrument(skip_all, fields(identity = %instance.identity()))]
    pub async fn collect(&self, instance: &InstanceConfig, source: Arc<dyn LogSource>) -> RunResult {
        let identity = instance.identity();
        let transforms = transform::build_chain(&instance.transforms);
        let started = Instant::now();
        let mut delivered = 0usize;

        debug!(source = source.kind(), "Starting run");

        let result = match self
            .try_collect(&identity, source, &transforms, &mut delivered)
            .await
        {
            Ok(()) => {
                info!(
                    records = delivered,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Run completed"
                );
                RunResult::success(identity.clone(), delivered, started.elapsed())
            }
            Err(Error::Conflict(key)) => {
                // Another run advanced this instance's pointer first. Its
                // progress stands; anything we flushed is deduplicated
                // downstream by record identifier. Not an operator problem.
                info!(key, "Pointer advanced concurrently, yielding");
                RunResult::failure(
                    identity.clone(),
                    Outcome::TransientFailure,
                    delivered,
                    started.elapsed(),
                    "checkpoint conflict",
                )
            }
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "Run failed permanently; operator intervention required");
                RunResult::failure(
                    identity.clone(),
                    Outcome::PermanentFailure,
                    delivered,
                    started.elapsed(),
                    e.to_string(),
                )
            }
            Err(e) => {
                warn!(error = %e, "Run failed, will retry on a later trigger");
                RunResult::failure(
                    identity.clone(),
                    Outcome::TransientFailure,
                    delivered,
                    started.elapsed(),
                    e.to_string(),
                )
            }
        };

        counter!(
            "collector_runs_total",
            "connector" => identity.connector.clone(),
            "outcome" => result.outcome.as_str()
        )
        .increment(1);
        histogram!("collector_run_duration_ms").record(started.elapsed().as_millis() as f64);

        result
    }

    async fn try_collect(
        &self,
        identity: &ConnectorIdentity,
        source: Arc<dyn LogSource>,
        transforms: &[Box<dyn Transform>],
        delivered: &mut usize,
    ) -> Result<()> {
        let pointer_key = identity.pointer_key();
        let stored = self.cache.get(&pointer_key).await?;

        let (mut pointer, expected) = match &stored {
            Some(entry) => (
                Pointer::decode(&entry.value)?,
                Expected::Version(entry.version),
            ),
            None => {
                let initial = match source.order() {
                    CollectionOrder::Chronological => Pointer::watermark(
                        Utc::now() - chrono::Duration::days(self.config.lookback_days),
                    ),
                    CollectionOrder::Cursor => Pointer::cursor(),
                };
                (initial, Expected::Absent)
            }
        };
        let original = pointer.encode()?;

        // The watermark read here also bounds the source's own `since`
        // filter; overlap past it is dropped client-side below.
        let since = pointer.watermark_at();
        let mut cursor = pointer.cursor_token();

        let deadline = Instant::now() + Duration::from_secs(self.config.run_budget_secs);
        let mut pages = 0u32;

        loop {
            if pages >= self.config.max_pages_per_run {
                debug!(pages, "Page budget reached, yielding to the scheduler");
                break;
            }
            if Instant::now() >= deadline {
                debug!(pages, "Run time budget reached, yielding to the scheduler");
                break;
            }

            let page = retry_with_backoff(
                || source.fetch_page(since, cursor.clone()),
                self.config.max_retries,
                self.config.retry_base_delay_ms,
                "fetch_page",
            )
            .await?;
            pages += 1;

            let fetched = page.entries.len();
            let fresh = pointer.filter_seen(page.entries);
            debug!(
                fetched,
                fresh = fresh.len(),
                page = pages,
                "Filtered page against pointer"
            );

            if !fresh.is_empty() {
                let shipped = transform::apply_chain(transforms, fresh.clone());
                for chunk in shipped.chunks(self.config.batch_size) {
                    let flush_started = Instant::now();
                    retry_with_backoff(
                        || self.output.flush(identity, chunk),
                        self.config.max_retries,
                        self.config.retry_base_delay_ms,
                        "flush_batch",
                    )
                    .await?;
                    histogram!("collector_flush_duration_ms")
                        .record(flush_started.elapsed().as_millis() as f64);
                    *delivered += chunk.len();
                }
                counter!(
                    "collector_records_total",
                    "connector" => identity.connector.clone()
                )
                .increment(shipped.len() as u64);

                // Checkpoints track the pre-transform records; transforms
                // must never affect what counts as collected.
                pointer.advance(&fresh, page.cursor.as_deref());
            } else {
                // Cursor-ordered progress still moves across empty pages.
                pointer.advance(&[], page.cursor.as_deref());
            }

            cursor = page.cursor;
            if !page.has_more {
                break;
            }
        }

        let encoded = pointer.encode()?;
        if encoded == original && matches!(expected, Expected::Version(_)) {
            debug!("No new records; pointer left unchanged");
            return Ok(());
        }

        let version = self.cache.put(&pointer_key, &encoded, expected).await?;
        debug!(version, "Pointer advanced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Entry, MemoryCache};
    use crate::model::{LogEntry, Page};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn entry(id: &str, secs: i64) -> LogEntry {
        LogEntry::new(id, ts(secs), serde_json::json!({ "id": id }))
    }

    fn page(entries: Vec<LogEntry>, cursor: Option<&str>, has_more: bool) -> Page {
        Page {
            entries,
            cursor: cursor.map(str::to_string),
            has_more,
        }
    }

    fn test_config() -> CollectionConfig {
        CollectionConfig {
            batch_size: 100,
            max_pages_per_run: 10,
            run_budget_secs: 30,
            // Scripted records carry epoch-second timestamps; look back far
            // enough that the initial watermark sits before 1970.
            lookback_days: 30000,
            max_retries: 1,
            retry_base_delay_ms: 1,
        }
    }

    fn instance(connector: &str) -> InstanceConfig {
        InstanceConfig {
            connector: connector.to_string(),
            name: "test".to_string(),
            frequency_secs: None,
            secret: None,
            params: serde_json::Map::new(),
            transforms: Vec::new(),
            disabled: false,
        }
    }

    /// Serves a scripted sequence of pages and records the cursor passed to
    /// each fetch.
    #[derive(Debug)]
    struct ScriptedSource {
        order: CollectionOrder,
        pages: Mutex<VecDeque<Result<Page>>>,
        cursors_seen: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(order: CollectionOrder, pages: Vec<Result<Page>>) -> Arc<Self> {
            Arc::new(Self {
                order,
                pages: Mutex::new(pages.into()),
                cursors_seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LogSource for ScriptedSource {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        fn order(&self) -> CollectionOrder {
            self.order
        }

        async fn fetch_page(
            &self,
            _since: Option<DateTime<Utc>>,
            cursor: Option<String>,
        ) -> Result<Page> {
            self.cursors_seen.lock().unwrap().push(cursor);
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(page(Vec::new(), None, false)))
        }
    }

    /// Records flushed batches and can be told to fail specific flush calls.
    #[derive(Default)]
    struct RecordingOutput {
        batches: Mutex<Vec<Vec<String>>>,
        fail_calls: Mutex<Vec<usize>>,
        calls: Mutex<usize>,
    }

    impl RecordingOutput {
        fn flushed_ids(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Output for RecordingOutput {
        async fn flush(&self, _identity: &ConnectorIdentity, entries: &[LogEntry]) -> Result<()> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let current = *calls;
                *calls += 1;
                current
            };
            if self.fail_calls.lock().unwrap().contains(&call) {
                return Err(Error::Output("sink unavailable".to_string()));
            }
            self.batches
                .lock()
                .unwrap()
                .push(entries.iter().map(|e| e.id.clone()).collect());
            Ok(())
        }
    }

    fn runtime(
        cache: Arc<dyn Cache>,
        output: Arc<RecordingOutput>,
    ) -> ConnectorRuntime {
        ConnectorRuntime::new(cache, output, test_config())
    }

    async fn stored_pointer(cache: &dyn Cache, identity: &ConnectorIdentity) -> Option<Pointer> {
        cache
            .get(&identity.pointer_key())
            .await
            .unwrap()
            .map(|entry| Pointer::decode(&entry.value).unwrap())
    }

    #[tokio::test]
    async fn first_run_collects_and_creates_the_pointer() {
        let cache = Arc::new(MemoryCache::new());
        let output = Arc::new(RecordingOutput::default());
        let runtime = runtime(cache.clone(), output.clone());
        let instance = instance("scripted");

        let source = ScriptedSource::new(
            CollectionOrder::Chronological,
            vec![Ok(page(
                vec![entry("a", 10), entry("b", 20), entry("c", 30)],
                None,
                false,
            ))],
        );

        let result = runtime.collect(&instance, source).await;
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.records, 3);
        assert_eq!(output.flushed_ids(), vec![vec!["a", "b", "c"]]);

        let pointer = stored_pointer(cache.as_ref(), &instance.identity())
            .await
            .expect("pointer created on first successful run");
        assert_eq!(pointer.watermark_at(), Some(ts(30)));
    }

    #[tokio::test]
    async fn second_run_drops_the_boundary_overlap() {
        let cache = Arc::new(MemoryCache::new());
        let output = Arc::new(RecordingOutput::default());
        let runtime = runtime(cache.clone(), output.clone());
        let instance = instance("scripted");

        let first = ScriptedSource::new(
            CollectionOrder::Chronological,
            vec![Ok(page(
                vec![entry("a", 10), entry("b", 20), entry("c", 30)],
                None,
                false,
            ))],
        );
        runtime.collect(&instance, first).await;

        // The API replays 20 and 30 alongside new data at 40.
        let second = ScriptedSource::new(
            CollectionOrder::Chronological,
            vec![Ok(page(
                vec![entry("b", 20), entry("c", 30), entry("d", 40)],
                None,
                false,
            ))],
        );
        let result = runtime.collect(&instance, second).await;

        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.records, 1);
        assert_eq!(
            output.flushed_ids(),
            vec![vec!["a", "b", "c"], vec!["d"]]
        );

        let pointer = stored_pointer(cache.as_ref(), &instance.identity())
            .await
            .unwrap();
        assert_eq!(pointer.watermark_at(), Some(ts(40)));
    }

    #[tokio::test]
    async fn flush_failure_leaves_the_pointer_untouched() {
        let cache = Arc::new(MemoryCache::new());
        let output = Arc::new(RecordingOutput::default());
        output.fail_calls.lock().unwrap().push(1);
        let runtime = runtime(cache.clone(), output.clone());
        let instance = instance("scripted");

        // Two pages; the second page's flush fails.
        let source = ScriptedSource::new(
            CollectionOrder::Chronological,
            vec![
                Ok(page(vec![entry("a", 10)], Some("p2"), true)),
                Ok(page(vec![entry("b", 20)], None, false)),
            ],
        );

        let result = runtime.collect(&instance, source).await;
        assert_eq!(result.outcome, Outcome::TransientFailure);
        // Batch one was durably delivered but the pointer did not move past
        // it, so the next run re-fetches and re-flushes everything.
        assert!(stored_pointer(cache.as_ref(), &instance.identity())
            .await
            .is_none());

        let retry = ScriptedSource::new(
            CollectionOrder::Chronological,
            vec![
                Ok(page(vec![entry("a", 10)], Some("p2"), true)),
                Ok(page(vec![entry("b", 20)], None, false)),
            ],
        );
        let result = runtime.collect(&instance, retry).await;
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(
            output.flushed_ids(),
            vec![vec!["a"], vec!["a"], vec!["b"]]
        );
        let pointer = stored_pointer(cache.as_ref(), &instance.identity())
            .await
            .unwrap();
        assert_eq!(pointer.watermark_at(), Some(ts(20)));
    }

    #[tokio::test]
    async fn unchanged_pointer_and_no_records_writes_nothing() {
        let cache = Arc::new(MemoryCache::new());
        let output = Arc::new(RecordingOutput::default());
        let runtime = runtime(cache.clone(), output.clone());
        let instance = instance("scripted");

        let first = ScriptedSource::new(
            CollectionOrder::Chronological,
            vec![Ok(page(vec![entry("a", 10)], None, false))],
        );
        runtime.collect(&instance, first).await;

        let version_before = cache
            .get(&instance.identity().pointer_key())
            .await
            .unwrap()
            .unwrap()
            .version;

        // Replay of already-collected data only.
        let second = ScriptedSource::new(
            CollectionOrder::Chronological,
            vec![Ok(page(vec![entry("a", 10)], None, false))],
        );
        let result = runtime.collect(&instance, second).await;

        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.records, 0);
        assert_eq!(output.flushed_ids().len(), 1);

        let version_after = cache
            .get(&instance.identity().pointer_key())
            .await
            .unwrap()
            .unwrap()
            .version;
        assert_eq!(version_before, version_after);
    }

    #[tokio::test]
    async fn page_budget_checkpoints_partial_progress() {
        let cache = Arc::new(MemoryCache::new());
        let output = Arc::new(RecordingOutput::default());
        let mut config = test_config();
        config.max_pages_per_run = 1;
        let runtime = ConnectorRuntime::new(cache.clone(), output.clone(), config);
        let instance = instance("scripted");

        let source = ScriptedSource::new(
            CollectionOrder::Chronological,
            vec![
                Ok(page(vec![entry("a", 10)], Some("p2"), true)),
                Ok(page(vec![entry("b", 20)], None, false)),
            ],
        );

        let result = runtime.collect(&instance, source).await;
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.records, 1);

        // Progress made before yielding is checkpointed; the scheduler will
        // re-trigger to continue.
        let pointer = stored_pointer(cache.as_ref(), &instance.identity())
            .await
            .unwrap();
        assert_eq!(pointer.watermark_at(), Some(ts(10)));
    }

    #[tokio::test]
    async fn cursor_sources_persist_the_resumption_token() {
        let cache = Arc::new(MemoryCache::new());
        let output = Arc::new(RecordingOutput::default());
        let runtime = runtime(cache.clone(), output.clone());
        let instance = instance("scripted");

        let first = ScriptedSource::new(
            CollectionOrder::Cursor,
            vec![
                Ok(page(vec![entry("a", 10)], Some("c1"), true)),
                Ok(page(vec![entry("b", 20)], Some("c2"), false)),
            ],
        );
        let result = runtime.collect(&instance, first.clone()).await;
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(
            *first.cursors_seen.lock().unwrap(),
            vec![None, Some("c1".to_string())]
        );

        let pointer = stored_pointer(cache.as_ref(), &instance.identity())
            .await
            .unwrap();
        assert_eq!(pointer.cursor_token(), Some("c2".to_string()));

        // The next run resumes from the stored token.
        let second = ScriptedSource::new(
            CollectionOrder::Cursor,
            vec![Ok(page(Vec::new(), Some("c2"), false))],
        );
        runtime.collect(&instance, second.clone()).await;
        assert_eq!(
            *second.cursors_seen.lock().unwrap(),
            vec![Some("c2".to_string())]
        );
    }

    #[tokio::test]
    async fn transforms_shape_output_but_not_the_checkpoint() {
        let cache = Arc::new(MemoryCache::new());
        let output = Arc::new(RecordingOutput::default());
        let runtime = runtime(cache.clone(), output.clone());

        let mut filtered = instance("scripted");
        filtered.transforms = vec![crate::transform::TransformConfig::Filter {
            path: "/id".to_string(),
            equals: serde_json::json!("b"),
        }];

        let source = ScriptedSource::new(
            CollectionOrder::Chronological,
            vec![Ok(page(
                vec![entry("a", 10), entry("b", 20), entry("c", 30)],
                None,
                false,
            ))],
        );

        let result = runtime.collect(&filtered, source).await;
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(output.flushed_ids(), vec![vec!["b"]]);

        // The watermark reflects all fetched records, not the filtered set.
        let pointer = stored_pointer(cache.as_ref(), &filtered.identity())
            .await
            .unwrap();
        assert_eq!(pointer.watermark_at(), Some(ts(30)));
    }

    #[tokio::test]
    async fn fatal_source_errors_disable_the_run() {
        let cache = Arc::new(MemoryCache::new());
        let output = Arc::new(RecordingOutput::default());
        let runtime = runtime(cache.clone(), output.clone());
        let instance = instance("scripted");

        let source = ScriptedSource::new(
            CollectionOrder::Chronological,
            vec![Err(Error::Auth("token rejected".to_string()))],
        );

        let result = runtime.collect(&instance, source).await;
        assert_eq!(result.outcome, Outcome::PermanentFailure);
        assert!(stored_pointer(cache.as_ref(), &instance.identity())
            .await
            .is_none());
    }

    /// Delegates to a MemoryCache but sneaks a competing pointer write in
    /// before the first conditional put, simulating a concurrent run that
    /// advanced the instance first.
    #[derive(Debug)]
    struct TamperCache {
        inner: MemoryCache,
        tampered: AtomicBool,
    }

    #[async_trait]
    impl Cache for TamperCache {
        async fn get(&self, key: &str) -> Result<Option<Entry>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &str, expected: Expected) -> Result<u64> {
            if key.starts_with("pointer/") && !self.tampered.swap(true, Ordering::SeqCst) {
                self.inner
                    .put(key, "{\"kind\":\"cursor\",\"token\":\"other\"}", Expected::Any)
                    .await?;
            }
            self.inner.put(key, value, expected).await
        }

        async fn delete(&self, key: &str, expected: Expected) -> Result<()> {
            self.inner.delete(key, expected).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn checkpoint_conflict_is_a_transient_no_op() {
        let cache = Arc::new(TamperCache {
            inner: MemoryCache::new(),
            tampered: AtomicBool::new(false),
        });
        let output = Arc::new(RecordingOutput::default());
        let runtime = ConnectorRuntime::new(cache.clone(), output.clone(), test_config());
        let instance = instance("scripted");

        let source = ScriptedSource::new(
            CollectionOrder::Chronological,
            vec![Ok(page(vec![entry("a", 10)], None, false))],
        );

        let result = runtime.collect(&instance, source).await;
        assert_eq!(result.outcome, Outcome::TransientFailure);

        // The winner's pointer is untouched by the loser.
        let entry = cache
            .get(&instance.identity().pointer_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.value, "{\"kind\":\"cursor\",\"token\":\"other\"}");
    }
}

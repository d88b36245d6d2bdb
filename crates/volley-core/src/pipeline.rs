use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::engine::RawResult;
use crate::error::{Error, Result};
use crate::export::{ExportRun, LedgerRow};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::storage::{StorageRecord, StorageWriter};
use crate::summary::Summary;

/// Consumer of live snapshots, e.g. a dashboard.
pub trait LiveSink: Send + Sync {
    fn publish(&self, snapshot: MetricsSnapshot);
}

impl LiveSink for watch::Sender<MetricsSnapshot> {
    fn publish(&self, snapshot: MetricsSnapshot) {
        self.send_replace(snapshot);
    }
}

impl LiveSink for mpsc::UnboundedSender<MetricsSnapshot> {
    fn publish(&self, snapshot: MetricsSnapshot) {
        // a closed receiver only means nobody is watching
        let _ = self.send(snapshot);
    }
}

/// Sink that drops every snapshot.
pub struct Discard;

impl LiveSink for Discard {
    fn publish(&self, _snapshot: MetricsSnapshot) {}
}

/// Per-result fan-out. Each consumer has its own failure policy:
/// the aggregator cannot fail, storage is logged and skipped, export ends the
/// run.
pub struct Pipeline<'a> {
    metrics: Arc<MetricsAggregator>,
    storage: Arc<dyn StorageWriter>,
    export: Option<ExportRun>,
    sink: &'a dyn LiveSink,
    storage_failures: u64,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        metrics: Arc<MetricsAggregator>,
        storage: Arc<dyn StorageWriter>,
        export: Option<ExportRun>,
        sink: &'a dyn LiveSink,
    ) -> Self {
        Self {
            metrics,
            storage,
            export,
            sink,
            storage_failures: 0,
        }
    }

    pub fn storage_failures(&self) -> u64 {
        self.storage_failures
    }

    pub fn process(&mut self, result: &RawResult) -> Result<()> {
        self.metrics.add(result);
        let snapshot = self.metrics.snapshot();

        let record = StorageRecord::new(result, &snapshot);
        if let Err(e) = self.storage.insert(&record) {
            self.storage_failures += 1;
            warn!("Failed to store result: {}", e);
        }

        if let Some(run) = self.export.as_mut() {
            // write_result aborts the run itself on failure
            run.write_result(&LedgerRow::from_result(result))
                .map_err(Error::ExportWrite)?;
        }

        self.sink.publish(snapshot);
        Ok(())
    }

    /// Finalize metrics, publish the final snapshot and commit the export.
    pub fn close(&mut self) -> Result<MetricsSnapshot> {
        self.metrics.finalize();
        let snapshot = self.metrics.snapshot();
        self.sink.publish(snapshot.clone());

        if let Some(run) = self.export.as_mut() {
            let meta = run.meta();
            let summary = Summary::new(
                &meta.target_url,
                &meta.method,
                meta.rate,
                meta.duration,
                &snapshot,
            );
            run.close(&summary).map_err(Error::ExportClose)?;
        }
        Ok(snapshot)
    }

    /// Discard any active export without touching the public ledger.
    pub fn abort(&mut self) {
        if let Some(run) = self.export.as_mut() {
            if let Err(e) = run.abort() {
                warn!("Failed to abort export run {}: {}", run.meta().id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportMeta, FileExporter, LEDGER_FILENAME};
    use crate::storage::{MemoryStorage, StorageError, StorageReader, LATENCY};
    use chrono::{TimeDelta, Utc};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    struct FailingStorage {
        calls: AtomicUsize,
    }

    impl StorageWriter for FailingStorage {
        fn insert(&self, _record: &StorageRecord) -> Result<(), StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Backend("disk full".into()))
        }
    }

    fn result(code: u16) -> RawResult {
        RawResult {
            code,
            timestamp: Utc::now(),
            latency: Duration::from_millis(12),
            bytes_in: 64,
            bytes_out: 0,
            error: None,
        }
    }

    fn meta(id: &str) -> ExportMeta {
        ExportMeta {
            id: id.to_string(),
            target_url: "http://localhost".to_string(),
            method: "GET".to_string(),
            rate: 10,
            duration: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_storage_failure_does_not_stop_export_or_publish() {
        let dir = tempdir().unwrap();
        let run = FileExporter::new(dir.path()).start_run(meta("s")).unwrap();
        let storage = Arc::new(FailingStorage {
            calls: AtomicUsize::new(0),
        });
        let metrics = Arc::new(MetricsAggregator::new().unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut pipeline = Pipeline::new(metrics.clone(), storage.clone(), Some(run), &tx);
        pipeline.process(&result(200)).unwrap();
        pipeline.process(&result(500)).unwrap();
        pipeline.close().unwrap();

        assert_eq!(storage.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.storage_failures(), 2);
        assert_eq!(metrics.snapshot().requests, 2);

        let published: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let counts: Vec<_> = published.iter().map(|s| s.requests).collect();
        assert_eq!(counts, vec![1, 2, 2]);

        let ledger = fs::read_to_string(dir.path().join(LEDGER_FILENAME)).unwrap();
        assert_eq!(ledger.lines().count(), 3);
    }

    #[test]
    fn test_storage_receives_cumulative_percentiles() {
        let storage = Arc::new(MemoryStorage::new());
        let metrics = Arc::new(MetricsAggregator::new().unwrap());
        let mut pipeline = Pipeline::new(metrics, storage.clone(), None, &Discard);

        let start = Utc::now() - TimeDelta::seconds(1);
        pipeline.process(&result(200)).unwrap();
        pipeline.process(&result(200)).unwrap();
        let snapshot = pipeline.close().unwrap();

        let values = storage
            .select(LATENCY, start, Utc::now() + TimeDelta::seconds(1))
            .unwrap();
        assert_eq!(values, vec![12.0, 12.0]);
        assert_eq!(snapshot.requests, 2);
    }

    #[test]
    fn test_export_write_after_abort_fails_run() {
        let dir = tempdir().unwrap();
        let run = FileExporter::new(dir.path()).start_run(meta("w")).unwrap();
        let metrics = Arc::new(MetricsAggregator::new().unwrap());
        let (tx, rx) = watch::channel(MetricsSnapshot::default());
        let mut pipeline =
            Pipeline::new(metrics, Arc::new(MemoryStorage::new()), Some(run), &tx);

        pipeline.process(&result(200)).unwrap();
        pipeline.abort();
        let err = pipeline.process(&result(200)).unwrap_err();
        assert!(matches!(err, Error::ExportWrite(_)));
        // the failing result is aggregated but never published
        assert_eq!(rx.borrow().requests, 1);
        assert!(!dir.path().join(LEDGER_FILENAME).exists());
    }
}

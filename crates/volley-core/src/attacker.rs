use std::sync::{Arc, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{AttackOptions, Options};
use crate::engine::{AttackEngine, HttpEngine, Target};
use crate::error::{Error, Result};
use crate::export::{ExportMeta, FileExporter};
use crate::metrics::MetricsAggregator;
use crate::pacer::Pacer;
use crate::pipeline::{LiveSink, Pipeline};
use crate::storage::StorageWriter;

type IdGenerator = Box<dyn Fn() -> String + Send + Sync>;

const LABEL: &str = "volley";

/// Owns one attack from start to finish.
///
/// Results from the engine are fed, in order, to the metrics aggregator, the
/// storage backend, the export run (when an exporter is set) and the live
/// sink. An `Attacker` runs exactly once; `attack` consumes it.
pub struct Attacker {
    options: AttackOptions,
    engine: Arc<dyn AttackEngine>,
    storage: Arc<dyn StorageWriter>,
    metrics: Arc<MetricsAggregator>,
    exporter: Option<FileExporter>,
    id_generator: IdGenerator,
}

impl Attacker {
    /// Validate `options` and build the HTTP engine for `target`.
    pub fn new(storage: Arc<dyn StorageWriter>, target: &str, options: Options) -> Result<Self> {
        let options = AttackOptions::new(target, options)?;
        let engine = Arc::new(HttpEngine::new(&options)?);
        Self::with_engine(storage, options, engine)
    }

    pub fn with_engine(
        storage: Arc<dyn StorageWriter>,
        options: AttackOptions,
        engine: Arc<dyn AttackEngine>,
    ) -> Result<Self> {
        Ok(Self {
            options,
            engine,
            storage,
            metrics: Arc::new(MetricsAggregator::new()?),
            exporter: None,
            id_generator: Box::new(|| Uuid::new_v4().to_string()),
        })
    }

    /// Export results and a summary through `exporter`.
    pub fn exporter(mut self, exporter: FileExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Override how run ids are generated.
    pub fn id_generator(mut self, generator: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.id_generator = Box::new(generator);
        self
    }

    pub fn options(&self) -> &AttackOptions {
        &self.options
    }

    pub fn rate(&self) -> u64 {
        self.options.rate
    }

    pub fn duration(&self) -> Duration {
        self.options.duration
    }

    /// Shared handle for concurrent snapshot readers.
    pub fn metrics(&self) -> Arc<MetricsAggregator> {
        self.metrics.clone()
    }

    /// Run the attack until the engine's stream ends or `cancel` fires.
    ///
    /// Cancellation is not an error: the engine is stopped, the export run is
    /// discarded and `Ok(())` is returned.
    pub async fn attack(self, cancel: &CancellationToken, sink: &dyn LiveSink) -> Result<()> {
        let export = match &self.exporter {
            Some(exporter) => {
                let meta = ExportMeta {
                    id: (self.id_generator)(),
                    target_url: self.options.target.clone(),
                    method: self.options.method.to_string(),
                    rate: self.options.rate,
                    duration: self.options.duration,
                };
                info!("Exporting run {} to {}", meta.id, exporter.dir().display());
                Some(exporter.start_run(meta).map_err(Error::ExportStart)?)
            }
            None => None,
        };
        let mut pipeline = Pipeline::new(self.metrics.clone(), self.storage.clone(), export, sink);

        let mut results = match self.engine.attack(
            Target::from_options(&self.options),
            Pacer::new(self.options.rate),
            self.options.duration,
            LABEL,
        ) {
            Ok(results) => results,
            Err(e) => {
                pipeline.abort();
                return Err(e);
            }
        };

        info!(
            "Attacking {} with the {} engine: {} {}/s for {:?}",
            self.options.target,
            self.engine.name(),
            self.options.method,
            self.options.rate,
            self.options.duration
        );

        let stopped = Once::new();
        let stop = || stopped.call_once(|| self.engine.stop());

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    stop();
                    pipeline.abort();
                    info!(
                        "Attack cancelled after {} results",
                        self.metrics.snapshot().requests
                    );
                    return Ok(());
                }

                next = results.recv() => {
                    let Some(result) = next else {
                        break;
                    };
                    if let Err(e) = pipeline.process(&result) {
                        stop();
                        return Err(e);
                    }
                }
            }
        }

        let snapshot = pipeline.close()?;
        if pipeline.storage_failures() > 0 {
            warn!(
                "{} of {} results could not be stored",
                pipeline.storage_failures(),
                snapshot.requests
            );
        }
        info!(
            "Attack finished: {} requests, {:.2}% success",
            snapshot.requests,
            snapshot.success * 100.0
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RawResult, ReplayEngine};
    use crate::export::{is_temp_name, ExportError, LedgerRow, LEDGER_FILENAME};
    use crate::metrics::MetricsSnapshot;
    use crate::pipeline::Discard;
    use crate::storage::MemoryStorage;
    use crate::summary::Summary;
    use chrono::{TimeDelta, Utc};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn options() -> AttackOptions {
        AttackOptions::new(
            "http://localhost:8080",
            Options {
                rate: Some(10),
                duration_ms: Some(1000),
                ..Options::default()
            },
        )
        .unwrap()
    }

    fn results(codes: &[u16]) -> Vec<RawResult> {
        let start = Utc::now();
        codes
            .iter()
            .enumerate()
            .map(|(i, code)| RawResult {
                code: *code,
                timestamp: start + TimeDelta::milliseconds(i as i64 * 100),
                latency: Duration::from_millis(20 + i as u64),
                bytes_in: 128,
                bytes_out: 0,
                error: (*code >= 400).then(|| format!("{code}")),
            })
            .collect()
    }

    fn attacker(engine: Arc<ReplayEngine>, dir: &Path, id: &'static str) -> Attacker {
        Attacker::with_engine(Arc::new(MemoryStorage::new()), options(), engine)
            .unwrap()
            .exporter(FileExporter::new(dir))
            .id_generator(move || id.to_string())
    }

    fn seed_ledger(dir: &Path) -> Vec<u8> {
        let mut run = FileExporter::new(dir)
            .start_run(ExportMeta {
                id: "earlier".into(),
                target_url: "http://localhost:8080".into(),
                method: "GET".into(),
                rate: 1,
                duration: Duration::from_secs(1),
            })
            .unwrap();
        run.write_result(&LedgerRow::from_result(&results(&[200])[0]))
            .unwrap();
        run.close(&Summary::new(
            "http://localhost:8080",
            "GET",
            1,
            Duration::from_secs(1),
            &MetricsSnapshot::default(),
        ))
        .unwrap();
        fs::read(dir.join(LEDGER_FILENAME)).unwrap()
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_new_rejects_empty_target() {
        let result = Attacker::new(Arc::new(MemoryStorage::new()), "", Options::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_attack_runs_to_completion() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(ReplayEngine::new(results(&[200, 200, 503])));
        let attacker = attacker(engine.clone(), dir.path(), "run-1");
        let metrics = attacker.metrics();
        let (tx, mut rx) = mpsc::unbounded_channel();

        attacker.attack(&CancellationToken::new(), &tx).await.unwrap();

        let published: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            published.iter().map(|s| s.requests).collect::<Vec<_>>(),
            vec![1, 2, 3, 3]
        );
        assert_eq!(engine.stop_count(), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.errors, vec!["503".to_string()]);

        let ledger = fs::read_to_string(dir.path().join(LEDGER_FILENAME)).unwrap();
        let lines: Vec<_> = ledger.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[3].starts_with("run-1,"));
        assert!(lines[3].ends_with(",http://localhost:8080,GET,503"));

        let summary: Summary =
            serde_json::from_slice(&fs::read(dir.path().join("summary-run-1.json")).unwrap())
                .unwrap();
        assert_eq!(summary.requests.count, 3);
        assert_eq!(summary.parameters.rate, 10);
        assert_eq!(summary.status_codes["200"], 2);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_aborts_export() {
        let dir = tempdir().unwrap();
        let before = seed_ledger(dir.path());

        let engine = Arc::new(ReplayEngine::new(results(&[200, 200])).hold_open());
        let attacker = attacker(engine.clone(), dir.path(), "cancelled");
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<MetricsSnapshot>();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                if snapshot.requests == 2 {
                    trigger.cancel();
                }
            }
        });

        attacker.attack(&cancel, &tx).await.unwrap();

        assert_eq!(engine.stop_count(), 1);
        assert_eq!(fs::read(dir.path().join(LEDGER_FILENAME)).unwrap(), before);
        assert_eq!(
            entries(dir.path()),
            vec!["results.csv".to_string(), "summary-earlier.json".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cancel_before_first_result() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(ReplayEngine::new(Vec::new()).hold_open());
        let cancel = CancellationToken::new();
        cancel.cancel();

        attacker(engine.clone(), dir.path(), "early")
            .attack(&cancel, &Discard)
            .await
            .unwrap();

        assert_eq!(engine.stop_count(), 1);
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_engine_failure_discards_export() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(ReplayEngine::failing("connection pool exhausted"));

        let err = attacker(engine, dir.path(), "failed")
            .attack(&CancellationToken::new(), &Discard)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Engine(_)));
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_export_start_failure() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(LEDGER_FILENAME)).unwrap();
        let engine = Arc::new(ReplayEngine::new(results(&[200])));

        let err = attacker(engine, dir.path(), "x")
            .attack(&CancellationToken::new(), &Discard)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExportStart(_)));
    }

    #[tokio::test]
    async fn test_ledger_write_failure_stops_attack() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(ReplayEngine::new(results(&[200; 300])));
        let attacker =
            Attacker::with_engine(Arc::new(MemoryStorage::new()), options(), engine.clone())
                .unwrap()
                .exporter(FileExporter::new(dir.path()).read_only_ledger())
                .id_generator(|| "unwritable".to_string());
        let metrics = attacker.metrics();

        let err = attacker
            .attack(&CancellationToken::new(), &Discard)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ExportWrite(ExportError::Io { .. })));
        assert_eq!(engine.stop_count(), 1);
        assert!(metrics.snapshot().requests < 300);
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_summary_commit_failure_fails_attack() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("summary-blocked.json")).unwrap();
        let engine = Arc::new(ReplayEngine::new(results(&[200, 200])));

        let err = attacker(engine.clone(), dir.path(), "blocked")
            .attack(&CancellationToken::new(), &Discard)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ExportClose(ExportError::Io { .. })));
        assert_eq!(engine.stop_count(), 0);
        assert!(entries(dir.path()).iter().all(|name| !is_temp_name(name)));
    }

    #[tokio::test]
    async fn test_attack_without_exporter() {
        let engine = Arc::new(ReplayEngine::new(results(&[200, 404])));
        let attacker =
            Attacker::with_engine(Arc::new(MemoryStorage::new()), options(), engine).unwrap();
        let metrics = attacker.metrics();

        attacker
            .attack(&CancellationToken::new(), &Discard)
            .await
            .unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.success, 0.5);
    }
}

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response, Url};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AttackOptions;
use crate::error::{Error, Result};
use crate::pacer::Pacer;
use crate::resolver::Resolver;

const RESULT_BUFFER: usize = 10_000;

/// Outcome of a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    /// HTTP status, 0 when no response was received
    pub code: u16,
    /// When the request was sent
    pub timestamp: DateTime<Utc>,
    pub latency: Duration,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub error: Option<String>,
}

impl RawResult {
    /// Time the response was fully read.
    pub fn end(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.latency)
            .ok()
            .and_then(|latency| self.timestamp.checked_add_signed(latency))
            .unwrap_or(self.timestamp)
    }
}

/// The request fired on every hit.
#[derive(Debug, Clone)]
pub struct Target {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Target {
    pub fn from_options(options: &AttackOptions) -> Self {
        Self {
            method: options.method.clone(),
            url: options.url.clone(),
            headers: options.headers.clone(),
            body: options.body.clone(),
        }
    }
}

/// Ordered results of one attack. The stream closes when the attack is over.
pub type ResultStream = mpsc::Receiver<RawResult>;

/// Load generator capability: owns sockets, pooling and pacing.
pub trait AttackEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start hitting `target` at the pacer's cadence for `duration`
    /// (zero: until stopped).
    fn attack(
        &self,
        target: Target,
        pacer: Pacer,
        duration: Duration,
        label: &str,
    ) -> Result<ResultStream>;

    /// Stop dispatching new hits. Safe to call more than once.
    fn stop(&self);
}

/// HTTP engine backed by a single shared `reqwest` client.
pub struct HttpEngine {
    client: Client,
    workers: usize,
    max_workers: usize,
    max_body: i64,
    stop: CancellationToken,
}

impl HttpEngine {
    pub fn new(options: &AttackOptions) -> Result<Self> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(if options.keep_alive {
                options.connections
            } else {
                0
            })
            .danger_accept_invalid_certs(options.tls.insecure_skip_verify);

        if !options.timeout.is_zero() {
            builder = builder.timeout(options.timeout);
        }
        if !options.http2 {
            builder = builder.http1_only();
        }
        if !options.local_addr.is_unspecified() {
            builder = builder.local_address(options.local_addr);
        }
        for cert in &options.tls.root_certificates {
            builder = builder.add_root_certificate(cert.clone());
        }
        if let Some(identity) = &options.tls.identity {
            builder = builder.identity(identity.clone());
        }
        if !options.resolvers.is_empty() {
            builder = builder.dns_resolver(Arc::new(Resolver::new(options.resolvers.clone())));
        }

        let client = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            workers: permits(options.workers),
            max_workers: permits(options.max_workers),
            max_body: options.max_body,
            stop: CancellationToken::new(),
        })
    }
}

impl AttackEngine for HttpEngine {
    fn name(&self) -> &'static str {
        "http"
    }

    fn attack(
        &self,
        target: Target,
        mut pacer: Pacer,
        duration: Duration,
        label: &str,
    ) -> Result<ResultStream> {
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let client = self.client.clone();
        let stop = self.stop.clone();
        let max_body = self.max_body;
        let ceiling = self.max_workers;
        let mut spawned = self.workers;
        let label = label.to_string();
        let target = Arc::new(target);

        info!(
            "Attack {:?}: {} {} at {}/s for {:?}",
            label,
            target.method,
            target.url,
            pacer.rate(),
            duration
        );

        tokio::spawn(async move {
            let deadline = (!duration.is_zero()).then(|| Instant::now() + duration);
            let workers = Arc::new(Semaphore::new(spawned));

            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = until(deadline) => break,
                    _ = pacer.wait() => {}
                }

                // Grow the pool one worker at a time while every worker is busy.
                if workers.available_permits() == 0 && spawned < ceiling {
                    workers.add_permits(1);
                    spawned += 1;
                }
                let permit = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = until(deadline) => break,
                    permit = workers.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let client = client.clone();
                let target = target.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = hit(&client, &target, max_body).await;
                    let _ = tx.send(result).await;
                    drop(permit);
                });
            }
            debug!(
                "Attack {:?} stopped dispatching after {} hits with {} workers",
                label,
                pacer.hits(),
                spawned
            );
        });

        Ok(rx)
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

fn permits(n: u64) -> usize {
    n.min(Semaphore::MAX_PERMITS as u64) as usize
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn hit(client: &Client, target: &Target, max_body: i64) -> RawResult {
    let timestamp = Utc::now();
    let started = Instant::now();
    let mut result = RawResult {
        code: 0,
        timestamp,
        latency: Duration::ZERO,
        bytes_in: 0,
        bytes_out: target.body.len() as u64,
        error: None,
    };

    let mut request = client
        .request(target.method.clone(), target.url.clone())
        .headers(target.headers.clone());
    if !target.body.is_empty() {
        request = request.body(target.body.clone());
    }

    match request.send().await {
        Ok(mut response) => {
            let status = response.status();
            result.code = status.as_u16();
            if let Err(err) = read_body(&mut response, max_body, &mut result.bytes_in).await {
                result.error = Some(err.to_string());
            } else if !(200..400).contains(&result.code) {
                result.error = Some(status.to_string());
            }
        }
        Err(err) => result.error = Some(err.to_string()),
    }

    result.latency = started.elapsed();
    result
}

async fn read_body(response: &mut Response, max_body: i64, read: &mut u64) -> reqwest::Result<()> {
    let limit = u64::try_from(max_body).ok();
    loop {
        if limit.is_some_and(|limit| *read >= limit) {
            return Ok(());
        }
        let Some(chunk) = response.chunk().await? else {
            return Ok(());
        };
        let remaining = limit.map_or(u64::MAX, |limit| limit - *read);
        *read += (chunk.len() as u64).min(remaining);
    }
}

/// Replays a fixed list of results instead of sending requests.
pub struct ReplayEngine {
    results: Vec<RawResult>,
    delay: Duration,
    hold_open: bool,
    failure: Option<String>,
    stop: CancellationToken,
    stops: AtomicUsize,
}

impl ReplayEngine {
    pub fn new(results: Vec<RawResult>) -> Self {
        Self {
            results,
            delay: Duration::ZERO,
            hold_open: false,
            failure: None,
            stop: CancellationToken::new(),
            stops: AtomicUsize::new(0),
        }
    }

    /// Pause before each replayed result.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keep the stream open after the last result until stopped.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Refuse to start, as an engine that cannot open its connections would.
    pub fn failing(message: impl Into<String>) -> Self {
        let mut engine = Self::new(Vec::new());
        engine.failure = Some(message.into());
        engine
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl AttackEngine for ReplayEngine {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn attack(
        &self,
        _target: Target,
        _pacer: Pacer,
        _duration: Duration,
        _label: &str,
    ) -> Result<ResultStream> {
        if let Some(message) = &self.failure {
            return Err(Error::engine(message.clone()));
        }
        let (tx, rx) = mpsc::channel(1);
        let results = self.results.clone();
        let delay = self.delay;
        let hold_open = self.hold_open;
        let stop = self.stop.clone();

        tokio::spawn(async move {
            for result in results {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                }
                if stop.is_cancelled() || tx.send(result).await.is_err() {
                    return;
                }
            }
            if hold_open {
                stop.cancelled().await;
            }
        });

        Ok(rx)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stop.cancel();
    }
}

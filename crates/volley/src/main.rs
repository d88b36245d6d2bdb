use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;
use volley_core::{
    is_temp_name, Attacker, FileConfig, FileExporter, MemoryStorage, MetricsAggregator,
    MetricsSnapshot, Options, TlsOptions, LEDGER_FILENAME,
};

#[derive(Parser, Debug)]
#[command(name = "volley", version)]
#[command(about = "Timed, rate-limited HTTP load test with live progress and durable export")]
struct Args {
    /// Target URL (http or https)
    target: String,

    /// Requests per second, 0 for as fast as possible
    #[arg(short, long)]
    rate: Option<u64>,

    /// How long to attack, e.g. 10s or 1m30s; 0 runs until interrupted
    #[arg(short, long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Per-request timeout, 0 disables it
    #[arg(short, long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// HTTP method
    #[arg(short, long)]
    method: Option<String>,

    /// Request header as "Key: Value", repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long, conflicts_with = "body_file")]
    body: Option<String>,

    /// File to read the request body from
    #[arg(short = 'B', long)]
    body_file: Option<PathBuf>,

    /// Max bytes of each response body to read, -1 for all
    #[arg(short = 'M', long, allow_negative_numbers = true)]
    max_body: Option<i64>,

    /// Initial number of workers
    #[arg(short, long)]
    workers: Option<u64>,

    /// Upper bound on workers
    #[arg(short = 'W', long)]
    max_workers: Option<u64>,

    /// Max idle connections per host
    #[arg(short, long)]
    connections: Option<usize>,

    /// Disable HTTP/2
    #[arg(long)]
    no_http2: bool,

    /// Disable keep-alive
    #[arg(short = 'K', long = "no-keepalive")]
    no_keepalive: bool,

    /// Local address to bind outgoing connections to
    #[arg(long)]
    local_addr: Option<IpAddr>,

    /// Comma-separated DNS servers, port 53 unless given
    #[arg(long, value_delimiter = ',')]
    resolvers: Vec<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Extra PEM CA certificate to trust, repeatable
    #[arg(long = "cacert")]
    ca_certs: Vec<PathBuf>,

    /// PEM client certificate
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM client private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Directory for results.csv and per-run summaries
    #[arg(long)]
    export_to: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// How often to log progress
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    report_interval: Duration,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    validate_target(&args.target)?;
    if args.report_interval.is_zero() {
        bail!("--report-interval must be greater than zero");
    }

    let file = match &args.config {
        Some(path) => FileConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => FileConfig::default(),
    };
    let export_dir = args.export_to.clone().or(file.export.dir.clone());
    let options = merge(&args, file.attack);

    let storage = Arc::new(MemoryStorage::new());
    let mut attacker =
        Attacker::new(storage, &args.target, options).context("Invalid attack options")?;
    if let Some(dir) = &export_dir {
        prepare_export_dir(dir)?;
        attacker = attacker.exporter(FileExporter::new(dir));
    }
    let metrics = attacker.metrics();

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping attack");
                cancel.cancel();
            }
        })
    };

    let (live_tx, live_rx) = watch::channel(MetricsSnapshot::default());
    let reporter = tokio::spawn(report_progress(
        metrics.clone(),
        live_rx,
        args.report_interval,
    ));

    let outcome = attacker.attack(&cancel, &live_tx).await;

    interrupt.abort();
    drop(live_tx);
    let _ = reporter.await;

    print_report(&metrics.snapshot(), cancel.is_cancelled());
    outcome.context("Attack failed")?;

    Ok(())
}

/// Layer command-line flags over the config file. Defaults are applied later
/// by the core.
fn merge(args: &Args, file: Options) -> Options {
    let (body, body_file) = if args.body.is_some() || args.body_file.is_some() {
        (args.body.clone(), args.body_file.clone())
    } else {
        (file.body, file.body_file)
    };
    let (cert, key) = if args.cert.is_some() {
        (args.cert.clone(), args.key.clone())
    } else {
        (file.tls.cert, file.tls.key)
    };

    Options {
        rate: args.rate.or(file.rate),
        duration_ms: args.duration.map(as_millis).or(file.duration_ms),
        timeout_ms: args.timeout.map(as_millis).or(file.timeout_ms),
        method: args.method.clone().or(file.method),
        headers: or_file(&args.headers, file.headers),
        body,
        body_file,
        max_body: args.max_body.or(file.max_body),
        workers: args.workers.or(file.workers),
        max_workers: args.max_workers.or(file.max_workers),
        connections: args.connections.or(file.connections),
        keep_alive: if args.no_keepalive {
            Some(false)
        } else {
            file.keep_alive
        },
        http2: if args.no_http2 { Some(false) } else { file.http2 },
        local_addr: args.local_addr.or(file.local_addr),
        resolvers: or_file(&args.resolvers, file.resolvers),
        tls: TlsOptions {
            insecure_skip_verify: args.insecure || file.tls.insecure_skip_verify,
            ca_certs: or_file(&args.ca_certs, file.tls.ca_certs),
            cert,
            key,
        },
    }
}

fn or_file<T: Clone>(cli: &[T], file: Vec<T>) -> Vec<T> {
    if cli.is_empty() {
        file
    } else {
        cli.to_vec()
    }
}

fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn validate_target(raw: &str) -> Result<()> {
    let url = Url::parse(raw).with_context(|| format!("Invalid target URL: {}", raw))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("Target must be an http or https URL, got {}", url.scheme());
    }
    if url.host_str().map_or(true, str::is_empty) {
        bail!("Target URL has no host: {}", raw);
    }
    Ok(())
}

/// Make sure `dir` can hold the ledger: create it if missing, accept it if
/// empty or already holding a ledger, reject anything else untouched.
fn prepare_export_dir(dir: &Path) -> Result<()> {
    match fs::metadata(dir) {
        Ok(info) if !info.is_dir() => {
            bail!("Export path {} is not a directory", dir.display())
        }
        Ok(_) => {
            // leftovers of an interrupted first run don't count
            let mut occupied = false;
            for entry in fs::read_dir(dir)
                .with_context(|| format!("Failed to read export directory {}", dir.display()))?
            {
                let entry = entry
                    .with_context(|| format!("Failed to read export directory {}", dir.display()))?;
                if !is_temp_name(&entry.file_name().to_string_lossy()) {
                    occupied = true;
                    break;
                }
            }
            if occupied && !dir.join(LEDGER_FILENAME).is_file() {
                bail!(
                    "Export directory {} is not empty and holds no {}",
                    dir.display(),
                    LEDGER_FILENAME
                );
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create export directory {}", dir.display())),
        Err(e) => {
            Err(e).with_context(|| format!("Failed to inspect export path {}", dir.display()))
        }
    }
}

async fn report_progress(
    metrics: Arc<MetricsAggregator>,
    mut live: watch::Receiver<MetricsSnapshot>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => print_progress(&metrics.snapshot()),
            changed = live.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

fn print_progress(snapshot: &MetricsSnapshot) {
    info!(
        "Progress: requests={} rate={:.2}/s success={:.2}% p50={:?} p99={:?} max={:?} errors={}",
        snapshot.requests,
        snapshot.rate,
        snapshot.success * 100.0,
        snapshot.latencies.p50,
        snapshot.latencies.p99,
        snapshot.latencies.max,
        snapshot.errors.len()
    );
}

fn print_report(snapshot: &MetricsSnapshot, cancelled: bool) {
    println!("\n=== Attack Summary ===");
    if cancelled {
        println!("(cancelled, partial results)");
    }
    println!("Requests: {}", snapshot.requests);
    println!("Rate: {:.2}/s", snapshot.rate);
    println!("Throughput: {:.2}/s", snapshot.throughput);
    println!("Success: {:.2}%", snapshot.success * 100.0);
    println!("Duration: {:?} (wait {:?})", snapshot.duration, snapshot.wait);

    let l = &snapshot.latencies;
    println!(
        "Latencies: mean={:?} p50={:?} p90={:?} p95={:?} p99={:?} max={:?} min={:?}",
        l.mean, l.p50, l.p90, l.p95, l.p99, l.max, l.min
    );
    println!(
        "Bytes in: total={} mean={:.2}",
        snapshot.bytes_in.total, snapshot.bytes_in.mean
    );
    println!(
        "Bytes out: total={} mean={:.2}",
        snapshot.bytes_out.total, snapshot.bytes_out.mean
    );

    let codes: Vec<_> = snapshot
        .status_codes
        .iter()
        .map(|(code, count)| format!("{}={}", code, count))
        .collect();
    println!("Status codes: {}", codes.join(" "));

    if !snapshot.errors.is_empty() {
        println!("Errors:");
        for error in &snapshot.errors {
            println!("  {}", error);
        }
    }
    println!();
}

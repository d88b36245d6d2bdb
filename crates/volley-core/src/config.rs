use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Certificate, Identity, Method, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::resolver;

pub const DEFAULT_RATE: u64 = 50;
pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_METHOD: Method = Method::GET;
pub const DEFAULT_WORKERS: u64 = 10;
pub const DEFAULT_MAX_WORKERS: u64 = u64::MAX;
/// Negative means the whole response body is read.
pub const DEFAULT_MAX_BODY: i64 = -1;
pub const DEFAULT_CONNECTIONS: usize = 10_000;
pub const DEFAULT_LOCAL_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

const STANDARD_METHODS: [Method; 9] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::CONNECT,
    Method::OPTIONS,
    Method::TRACE,
];

/// Configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub attack: Options,
    pub export: ExportConfig,
}

impl FileConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: FileConfig = toml::from_str(&contents)?;
        Ok(config)
    }
}

/// Raw attack settings as given by a config file or the command line.
///
/// Every field is optional; [`AttackOptions::new`] is the only place where
/// unset values turn into defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Requests per second; 0 sends as fast as possible
    pub rate: Option<u64>,
    /// Attack duration in milliseconds; 0 runs until cancelled
    pub duration_ms: Option<u64>,
    /// Per-request timeout in milliseconds; 0 disables it
    pub timeout_ms: Option<u64>,
    pub method: Option<String>,
    /// Request headers in `Key: Value` form
    pub headers: Vec<String>,
    pub body: Option<String>,
    pub body_file: Option<PathBuf>,
    /// Max response bytes captured per request; 0 or negative for no limit
    pub max_body: Option<i64>,
    /// Initial number of in-flight workers
    pub workers: Option<u64>,
    pub max_workers: Option<u64>,
    /// Max idle connections kept per host
    pub connections: Option<usize>,
    pub keep_alive: Option<bool>,
    pub http2: Option<bool>,
    pub local_addr: Option<IpAddr>,
    /// Name servers to rotate through, `ip[:port]`
    pub resolvers: Vec<String>,
    pub tls: TlsOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub insecure_skip_verify: bool,
    /// PEM files with extra trusted roots
    pub ca_certs: Vec<PathBuf>,
    /// PEM client certificate, used together with `key`
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory receiving `results.csv` and per-run summaries
    pub dir: Option<PathBuf>,
}

/// Validated configuration for one attack.
#[derive(Debug)]
pub struct AttackOptions {
    pub target: String,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub rate: u64,
    pub duration: Duration,
    pub timeout: Duration,
    pub max_body: i64,
    pub workers: u64,
    pub max_workers: u64,
    pub connections: usize,
    pub keep_alive: bool,
    pub http2: bool,
    pub local_addr: IpAddr,
    pub resolvers: Vec<SocketAddr>,
    pub tls: TlsSettings,
}

/// TLS material, loaded once at construction.
#[derive(Default)]
pub struct TlsSettings {
    pub insecure_skip_verify: bool,
    pub root_certificates: Vec<Certificate>,
    pub identity: Option<Identity>,
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("root_certificates", &self.root_certificates.len())
            .field("identity", &self.identity.is_some())
            .finish()
    }
}

impl AttackOptions {
    pub fn new(target: &str, options: Options) -> Result<Self> {
        if target.is_empty() {
            return Err(Error::config("target is required"));
        }
        let url = Url::parse(target)
            .map_err(|e| Error::config(format!("bad target URL {target:?}: {e}")))?;

        let method = match options.method.as_deref() {
            None | Some("") => DEFAULT_METHOD,
            Some(raw) => parse_method(raw)?,
        };
        let headers = parse_headers(&options.headers)?;
        let body = load_body(options.body, options.body_file.as_deref())?;

        let max_workers = options
            .max_workers
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_WORKERS);
        let workers = options
            .workers
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_WORKERS)
            .min(max_workers);

        let resolvers = resolver::parse_server_list(options.resolvers.as_slice())
            .map_err(|e| Error::config(e.to_string()))?;
        let tls = TlsSettings::load(&options.tls)?;

        Ok(Self {
            target: target.to_string(),
            url,
            method,
            headers,
            body,
            rate: options.rate.unwrap_or(DEFAULT_RATE),
            duration: options
                .duration_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_DURATION),
            timeout: options
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TIMEOUT),
            max_body: options
                .max_body
                .filter(|n| *n != 0)
                .unwrap_or(DEFAULT_MAX_BODY),
            workers,
            max_workers,
            connections: options
                .connections
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_CONNECTIONS),
            keep_alive: options.keep_alive.unwrap_or(true),
            http2: options.http2.unwrap_or(true),
            local_addr: options.local_addr.unwrap_or(DEFAULT_LOCAL_ADDR),
            resolvers,
            tls,
        })
    }
}

impl TlsSettings {
    fn load(options: &TlsOptions) -> Result<Self> {
        let mut root_certificates = Vec::with_capacity(options.ca_certs.len());
        for path in &options.ca_certs {
            let pem = read_file(path, "CA certificate")?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                Error::config(format!("invalid CA certificate {}: {e}", path.display()))
            })?;
            root_certificates.push(cert);
        }

        let identity = match (&options.cert, &options.key) {
            (None, None) => None,
            (Some(cert), Some(key)) => {
                let mut pem = read_file(cert, "client certificate")?;
                pem.push(b'\n');
                pem.extend(read_file(key, "client key")?);
                Some(Identity::from_pem(&pem).map_err(|e| {
                    Error::config(format!("invalid client identity {}: {e}", cert.display()))
                })?)
            }
            _ => {
                return Err(Error::config(
                    "client certificate and key must be given together",
                ))
            }
        };

        Ok(Self {
            insecure_skip_verify: options.insecure_skip_verify,
            root_certificates,
            identity,
        })
    }
}

fn parse_method(raw: &str) -> Result<Method> {
    STANDARD_METHODS
        .iter()
        .find(|m| m.as_str() == raw)
        .cloned()
        .ok_or_else(|| Error::config(format!("given method {raw:?} isn't an HTTP request method")))
}

/// Parses `Key: Value` pairs. Repeated keys are kept as separate values.
pub fn parse_headers(raw: &[String]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for hdr in raw {
        let bad = || Error::config(format!("given header {hdr:?} has a wrong format"));
        let (key, val) = hdr.split_once(':').ok_or_else(bad)?;
        let (key, val) = (key.trim(), val.trim());
        if key.is_empty() || val.is_empty() {
            return Err(bad());
        }
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| bad())?;
        let value = HeaderValue::from_str(val).map_err(|_| bad())?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn load_body(body: Option<String>, body_file: Option<&Path>) -> Result<Vec<u8>> {
    match (body, body_file) {
        (Some(b), Some(_)) if !b.is_empty() => Err(Error::config(
            "only one of body and body file can be specified",
        )),
        (_, Some(path)) => read_file(path, "body file"),
        (Some(b), None) => Ok(b.into_bytes()),
        (None, None) => Ok(Vec::new()),
    }
}

fn read_file(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::config(format!("unable to open {what} {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde() {
        let config_str = r#"
[attack]
rate = 200
duration_ms = 5000
method = "POST"
headers = ["Content-Type: application/json"]
body = '{"ping":true}'
resolvers = ["127.0.0.1:5353"]

[attack.tls]
insecure_skip_verify = true

[export]
dir = "results"
        "#;

        let config: FileConfig = toml::from_str(config_str).unwrap();
        assert_eq!(config.attack.rate, Some(200));
        assert_eq!(config.attack.duration_ms, Some(5000));
        assert_eq!(config.attack.method.as_deref(), Some("POST"));
        assert_eq!(config.attack.headers.len(), 1);
        assert!(config.attack.tls.insecure_skip_verify);
        assert_eq!(config.export.dir, Some(PathBuf::from("results")));
        assert!(config.attack.timeout_ms.is_none());
    }

    #[test]
    fn test_defaults_applied_at_construction() {
        let opts = AttackOptions::new("http://host.xz", Options::default()).unwrap();
        assert_eq!(opts.rate, DEFAULT_RATE);
        assert_eq!(opts.duration, DEFAULT_DURATION);
        assert_eq!(opts.timeout, DEFAULT_TIMEOUT);
        assert_eq!(opts.method, Method::GET);
        assert_eq!(opts.workers, DEFAULT_WORKERS);
        assert_eq!(opts.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(opts.max_body, DEFAULT_MAX_BODY);
        assert_eq!(opts.connections, DEFAULT_CONNECTIONS);
        assert_eq!(opts.local_addr, DEFAULT_LOCAL_ADDR);
        assert!(opts.keep_alive);
        assert!(opts.http2);
        assert!(opts.body.is_empty());
        assert!(opts.resolvers.is_empty());
    }

    #[test]
    fn test_explicit_zero_rate_is_kept() {
        let opts = AttackOptions::new(
            "http://host.xz",
            Options {
                rate: Some(0),
                duration_ms: Some(0),
                ..Options::default()
            },
        )
        .unwrap();
        assert_eq!(opts.rate, 0);
        assert_eq!(opts.duration, Duration::ZERO);
    }

    #[test]
    fn test_empty_target_rejected() {
        let err = AttackOptions::new("", Options::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_method_rejected() {
        let err = AttackOptions::new(
            "http://host.xz",
            Options {
                method: Some("FETCH".into()),
                ..Options::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("FETCH"));
    }

    #[test]
    fn test_zero_max_body_reads_whole_body() {
        let opts = AttackOptions::new(
            "http://host.xz",
            Options {
                max_body: Some(0),
                ..Options::default()
            },
        )
        .unwrap();
        assert_eq!(opts.max_body, DEFAULT_MAX_BODY);

        let opts = AttackOptions::new(
            "http://host.xz",
            Options {
                max_body: Some(512),
                ..Options::default()
            },
        )
        .unwrap();
        assert_eq!(opts.max_body, 512);
    }

    #[test]
    fn test_workers_clamped_to_max() {
        let opts = AttackOptions::new(
            "http://host.xz",
            Options {
                workers: Some(50),
                max_workers: Some(8),
                ..Options::default()
            },
        )
        .unwrap();
        assert_eq!(opts.workers, 8);
        assert_eq!(opts.max_workers, 8);
    }

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(&[
            "X-Trace: abc".to_string(),
            "Accept:  text/plain ".to_string(),
            "X-Trace: def".to_string(),
        ])
        .unwrap();
        assert_eq!(headers.get_all("x-trace").iter().count(), 2);
        assert_eq!(headers["accept"], "text/plain");

        assert!(parse_headers(&["NoColon".to_string()]).is_err());
        assert!(parse_headers(&["Key:".to_string()]).is_err());
        assert!(parse_headers(&[": value".to_string()]).is_err());
    }

    #[test]
    fn test_body_and_body_file_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.json");
        std::fs::write(&path, b"{}").unwrap();

        let err = AttackOptions::new(
            "http://host.xz",
            Options {
                body: Some("inline".into()),
                body_file: Some(path.clone()),
                ..Options::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let opts = AttackOptions::new(
            "http://host.xz",
            Options {
                body_file: Some(path),
                ..Options::default()
            },
        )
        .unwrap();
        assert_eq!(opts.body, b"{}");
    }

    #[test]
    fn test_half_identity_rejected() {
        let err = AttackOptions::new(
            "http://host.xz",
            Options {
                tls: TlsOptions {
                    cert: Some(PathBuf::from("client.pem")),
                    ..TlsOptions::default()
                },
                ..Options::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("together"));
    }
}

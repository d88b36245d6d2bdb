use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tempfile::{Builder, NamedTempFile};
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::RawResult;
use crate::summary::Summary;

pub const LEDGER_FILENAME: &str = "results.csv";
pub const LEDGER_HEADER: [&str; 6] = [
    "id",
    "timestamp",
    "latency_ns",
    "url",
    "method",
    "status_code",
];

pub const LEDGER_TEMP_PREFIX: &str = ".results.csv.";
pub const SUMMARY_TEMP_PREFIX: &str = ".summary.";

/// Whether `name` is an in-progress ledger or summary file.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with(LEDGER_TEMP_PREFIX) || name.starts_with(SUMMARY_TEMP_PREFIX)
}

pub fn summary_filename(id: &str) -> String {
    format!("summary-{id}.json")
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export run id is required")]
    MissingRunId,

    #[error("export run id {0:?} is not a plain file name")]
    InvalidRunId(String),

    #[error("export directory is required")]
    MissingDirectory,

    #[error("results path {} is a directory", .0.display())]
    LedgerIsDirectory(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("export run already finished")]
    Finished,

    #[error("failed to encode summary: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> ExportError {
    let context = context.into();
    move |source| ExportError::Io { context, source }
}

/// Identity and parameters of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportMeta {
    pub id: String,
    pub target_url: String,
    pub method: String,
    pub rate: u64,
    pub duration: Duration,
}

/// One ledger line. Empty `url`/`method` fall back to the run's target.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRow {
    pub timestamp: DateTime<Utc>,
    pub latency_ns: f64,
    pub url: String,
    pub method: String,
    pub status_code: u16,
}

impl LedgerRow {
    pub fn from_result(result: &RawResult) -> Self {
        Self {
            timestamp: result.timestamp,
            latency_ns: result.latency.as_nanos() as f64,
            url: String::new(),
            method: String::new(),
            status_code: result.code,
        }
    }
}

/// Run ids become part of the summary file name.
fn is_plain_name(id: &str) -> bool {
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == id
    )
}

/// Writes run ledgers and summaries into one directory.
#[derive(Debug, Clone)]
pub struct FileExporter {
    dir: PathBuf,
    #[cfg(test)]
    read_only_ledger: bool,
}

impl FileExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            #[cfg(test)]
            read_only_ledger: false,
        }
    }

    /// Open temp ledgers read-only so that row writes fail once flushed.
    #[cfg(test)]
    pub(crate) fn read_only_ledger(mut self) -> Self {
        self.read_only_ledger = true;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open a run. Rows go to a private temp file next to the ledger, seeded
    /// with the current ledger contents, until [`ExportRun::close`] renames it
    /// into place.
    pub fn start_run(&self, meta: ExportMeta) -> Result<ExportRun, ExportError> {
        if meta.id.is_empty() {
            return Err(ExportError::MissingRunId);
        }
        if !is_plain_name(&meta.id) {
            return Err(ExportError::InvalidRunId(meta.id));
        }
        if self.dir.as_os_str().is_empty() {
            return Err(ExportError::MissingDirectory);
        }
        let ledger_path = self.dir.join(LEDGER_FILENAME);
        let summary_path = self.dir.join(summary_filename(&meta.id));

        let mut temp = Builder::new()
            .prefix(LEDGER_TEMP_PREFIX)
            .tempfile_in(&self.dir)
            .map_err(io_error(format!(
                "failed to create temp results file in {}",
                self.dir.display()
            )))?;
        set_permissions(temp.as_file()).map_err(io_error(format!(
            "failed to chmod temp results file {}",
            temp.path().display()
        )))?;

        let existed = match fs::metadata(&ledger_path) {
            Ok(info) if info.is_dir() => {
                return Err(ExportError::LedgerIsDirectory(ledger_path));
            }
            Ok(_) => {
                let mut src = File::open(&ledger_path).map_err(io_error(format!(
                    "failed to open results file {}",
                    ledger_path.display()
                )))?;
                io::copy(&mut src, temp.as_file_mut()).map_err(io_error(format!(
                    "failed to copy results file {}",
                    ledger_path.display()
                )))?;
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(io_error(format!(
                    "failed to stat results file {}",
                    ledger_path.display()
                ))(e));
            }
        };

        #[cfg(test)]
        let temp = if self.read_only_ledger {
            reopen_read_only(temp)?
        } else {
            temp
        };

        let mut writer = BufWriter::new(temp);
        if !existed {
            write_record(&mut writer, &LEDGER_HEADER).map_err(io_error(format!(
                "failed to write results header to {}",
                ledger_path.display()
            )))?;
        }

        debug!(
            "Export run {} started in {} (ledger existed: {})",
            meta.id,
            self.dir.display(),
            existed
        );

        Ok(ExportRun {
            meta,
            ledger_path,
            summary_path,
            writer: Some(writer),
        })
    }
}

#[cfg(test)]
fn reopen_read_only(temp: NamedTempFile) -> Result<NamedTempFile, ExportError> {
    let (file, path) = temp.into_parts();
    drop(file);
    let file = File::open(&path).map_err(io_error(format!(
        "failed to reopen temp results file {}",
        path.display()
    )))?;
    Ok(NamedTempFile::from_parts(file, path))
}

/// A transactional export session. Nothing becomes visible until `close`.
#[derive(Debug)]
pub struct ExportRun {
    meta: ExportMeta,
    ledger_path: PathBuf,
    summary_path: PathBuf,
    /// `None` once the run is closed or aborted
    writer: Option<BufWriter<NamedTempFile>>,
}

impl ExportRun {
    pub fn meta(&self) -> &ExportMeta {
        &self.meta
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    pub fn is_finished(&self) -> bool {
        self.writer.is_none()
    }

    /// Append one row. On failure the run is aborted before returning.
    pub fn write_result(&mut self, row: &LedgerRow) -> Result<(), ExportError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(ExportError::Finished);
        };

        let url = if row.url.is_empty() {
            &self.meta.target_url
        } else {
            &row.url
        };
        let method = if row.method.is_empty() {
            &self.meta.method
        } else {
            &row.method
        };
        let timestamp = row.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let latency = format_latency_ns(row.latency_ns);
        let status_code = row.status_code.to_string();

        let written = write_record(
            writer,
            &[
                self.meta.id.as_str(),
                &timestamp,
                &latency,
                url,
                method,
                &status_code,
            ],
        );
        if let Err(source) = written {
            if let Err(e) = self.abort() {
                warn!("Failed to discard export run {}: {}", self.meta.id, e);
            }
            return Err(ExportError::Io {
                context: format!("failed to write results to {}", self.ledger_path.display()),
                source,
            });
        }
        Ok(())
    }

    /// Commit the ledger, then write the summary. Calling it again is a no-op.
    ///
    /// The run is finished even when this fails; a failure before the rename
    /// leaves the public ledger untouched.
    pub fn close(&mut self, summary: &Summary) -> Result<(), ExportError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };

        let temp = writer.into_inner().map_err(|e| ExportError::Io {
            context: format!("failed to flush results to {}", self.ledger_path.display()),
            source: e.into_error(),
        })?;
        temp.as_file().sync_all().map_err(io_error(format!(
            "failed to sync results file {}",
            temp.path().display()
        )))?;
        temp.persist(&self.ledger_path).map_err(|e| ExportError::Io {
            context: format!(
                "failed to replace results file {}",
                self.ledger_path.display()
            ),
            source: e.error,
        })?;

        write_summary(&self.summary_path, summary)?;
        debug!(
            "Export run {} committed to {}",
            self.meta.id,
            self.ledger_path.display()
        );
        Ok(())
    }

    /// Discard the temp ledger. Calling it again, or after `close`, is a no-op.
    pub fn abort(&mut self) -> Result<(), ExportError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let (temp, _unflushed) = writer.into_parts();
        let path = temp.path().to_path_buf();
        match temp.close() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(format!(
                "failed to remove temp results file {}",
                path.display()
            ))(e)),
        }
    }
}

impl Drop for ExportRun {
    fn drop(&mut self) {
        if self.writer.is_some() {
            warn!(
                "Export run {} dropped without close, discarding its rows",
                self.meta.id
            );
            if let Err(e) = self.abort() {
                warn!("Failed to discard export run {}: {}", self.meta.id, e);
            }
        }
    }
}

fn write_summary(path: &Path, summary: &Summary) -> Result<(), ExportError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = Builder::new()
        .prefix(SUMMARY_TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(io_error(format!(
            "failed to create temp summary file in {}",
            dir.display()
        )))?;
    set_permissions(temp.as_file()).map_err(io_error(format!(
        "failed to chmod temp summary file {}",
        temp.path().display()
    )))?;

    let mut json = serde_json::to_vec_pretty(summary)?;
    json.push(b'\n');
    temp.write_all(&json)
        .map_err(io_error(format!("failed to write summary {}", path.display())))?;
    temp.as_file()
        .sync_all()
        .map_err(io_error(format!("failed to sync summary {}", path.display())))?;
    temp.persist(path).map_err(|e| ExportError::Io {
        context: format!("failed to replace summary file {}", path.display()),
        source: e.error,
    })?;
    Ok(())
}

#[cfg(unix)]
fn set_permissions(file: &File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_permissions(_file: &File) -> io::Result<()> {
    Ok(())
}

fn format_latency_ns(value: f64) -> String {
    if value.is_finite() {
        (value as i64).to_string()
    } else {
        String::new()
    }
}

fn write_record<W: Write>(w: &mut W, fields: &[&str]) -> io::Result<()> {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        if needs_quotes(field) {
            w.write_all(b"\"")?;
            w.write_all(field.replace('"', "\"\"").as_bytes())?;
            w.write_all(b"\"")?;
        } else {
            w.write_all(field.as_bytes())?;
        }
    }
    w.write_all(b"\n")
}

fn needs_quotes(field: &str) -> bool {
    field == r"\."
        || field.contains([',', '"', '\r', '\n'])
        || field.starts_with(char::is_whitespace)
}

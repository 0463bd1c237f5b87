use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::core::settings::DownloadSettings;
use crate::error::{DownloadError, DownloadResult};

use super::progress::{ProgressSnapshot, ThroughputWindow};
use super::transport::{
    TransferRequest, Transport, STATUS_OK, STATUS_PARTIAL_CONTENT, STATUS_RANGE_NOT_SATISFIABLE,
};

/// One remote file and where its bytes end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub url: String,
    pub destination: PathBuf,
    /// `None` or zero when the size is not known up front.
    pub expected_bytes: Option<u64>,
    pub auth_token: Option<String>,
}

impl FileTransfer {
    fn known_size(&self) -> Option<u64> {
        self.expected_bytes.filter(|bytes| *bytes > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub throughput_window: usize,
}

impl From<&DownloadSettings> for TransferOptions {
    fn from(settings: &DownloadSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size.max(1),
            progress_interval: settings.progress_interval(),
            throughput_window: settings.throughput_window.max(1),
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from(&DownloadSettings::default())
    }
}

/// Cooperative cancel flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> DownloadResult<()> {
        if self.is_cancelled() {
            Err(DownloadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Moves an ordered list of files to disk, resuming whatever is already there.
pub struct TransferSession<'a> {
    transport: &'a dyn Transport,
    options: TransferOptions,
    cancel: CancelToken,
}

impl<'a> TransferSession<'a> {
    pub fn new(transport: &'a dyn Transport, options: TransferOptions) -> Self {
        Self {
            transport,
            options,
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Transfers every file in order and returns the cumulative byte count.
    ///
    /// Files are fetched strictly one after another; the first failure aborts the
    /// session and leaves everything written so far on disk for the next attempt.
    pub fn run<F>(&self, files: &[FileTransfer], total_bytes: u64, mut progress: F) -> DownloadResult<u64>
    where
        F: FnMut(ProgressSnapshot),
    {
        let mut window =
            ThroughputWindow::new(self.options.throughput_window, self.options.progress_interval);
        let mut received = 0u64;
        for file in files {
            self.cancel.check()?;
            received += self.transfer_file(file, received, total_bytes, &mut window, &mut progress)?;
        }
        Ok(received)
    }

    fn transfer_file<F>(
        &self,
        file: &FileTransfer,
        base: u64,
        total_bytes: u64,
        window: &mut ThroughputWindow,
        progress: &mut F,
    ) -> DownloadResult<u64>
    where
        F: FnMut(ProgressSnapshot),
    {
        if let Some(parent) = file.destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| DownloadError::io(format!("create {}", parent.display()), err))?;
        }

        let mut local_len = existing_len(&file.destination)?;
        if let Some(expected) = file.known_size() {
            if local_len == expected {
                debug!(
                    "{} already complete ({local_len} bytes), skipping request",
                    file.destination.display()
                );
                return Ok(local_len);
            }
            if local_len > expected {
                warn!(
                    "{} is {local_len} bytes, larger than the expected {expected}, restarting",
                    file.destination.display()
                );
                create_truncated(&file.destination)?;
                local_len = 0;
            }
        }

        let response = self.transport.open(&TransferRequest {
            url: file.url.clone(),
            resume_from: local_len,
            auth_token: file.auth_token.clone(),
        })?;

        let (start, mut output) = match response.status {
            STATUS_PARTIAL_CONTENT => {
                let start = response
                    .content_range
                    .and_then(|range| range.start)
                    .unwrap_or(local_len);
                if start != local_len {
                    return Err(DownloadError::ResumeMismatch {
                        url: file.url.clone(),
                        local_len,
                        server_start: start,
                    });
                }
                debug!("resuming {} from byte {start}", file.url);
                (start, open_for_append(&file.destination)?)
            }
            STATUS_OK => {
                if local_len > 0 {
                    warn!(
                        "{} ignored the range request, restarting from byte 0",
                        file.url
                    );
                    (0, create_truncated(&file.destination)?)
                } else {
                    (0, open_for_append(&file.destination)?)
                }
            }
            STATUS_RANGE_NOT_SATISFIABLE if local_len > 0 => {
                // A known size that matched would have been skipped above.
                if let Some(expected) = file.known_size() {
                    return Err(DownloadError::SizeMismatch {
                        path: file.destination.clone(),
                        expected,
                        actual: local_len,
                    });
                }
                let total = response.content_range.and_then(|range| range.total);
                return match total {
                    Some(total) if total != local_len => Err(DownloadError::Status {
                        url: file.url.clone(),
                        status: STATUS_RANGE_NOT_SATISFIABLE,
                    }),
                    _ => {
                        debug!("{} already complete on disk", file.destination.display());
                        Ok(local_len)
                    }
                };
            }
            status => {
                return Err(DownloadError::Status {
                    url: file.url.clone(),
                    status,
                })
            }
        };

        let mut body = response.body;
        let mut buffer = vec![0u8; self.options.chunk_size];
        let mut written = 0u64;
        loop {
            self.cancel.check()?;
            let read = match body.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(DownloadError::io(format!("read {}", file.url), err)),
            };
            output
                .write_all(&buffer[..read])
                .map_err(|err| DownloadError::io("write download chunk", err))?;
            written += read as u64;

            let received = base + start + written;
            if let Some(snapshot) = window.record(read as u64, received, total_bytes, Instant::now())
            {
                progress(snapshot);
            }
        }
        output
            .flush()
            .map_err(|err| DownloadError::io("flush download file", err))?;

        let final_len = start + written;
        if let Some(expected) = file.known_size() {
            if final_len != expected {
                return Err(DownloadError::SizeMismatch {
                    path: file.destination.clone(),
                    expected,
                    actual: final_len,
                });
            }
        }
        Ok(final_len)
    }
}

/// Length of a partial or complete file, zero when absent.
pub fn existing_len(path: &Path) -> DownloadResult<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(DownloadError::io(format!("stat {}", path.display()), err)),
    }
}

fn open_for_append(path: &Path) -> DownloadResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| DownloadError::io(format!("open {}", path.display()), err))
}

fn create_truncated(path: &Path) -> DownloadResult<File> {
    File::create(path).map_err(|err| DownloadError::io(format!("create {}", path.display()), err))
}

pub fn filename_from_uri(uri: &str) -> Option<String> {
    let last_segment = uri.split('/').last()?;
    let clean = last_segment.split('?').next()?.split('#').next()?.trim();
    if clean.is_empty() {
        None
    } else {
        Some(clean.to_string())
    }
}

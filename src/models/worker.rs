use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::core::events::{ForegroundNotice, JobHost, ProgressData};
use crate::core::launch::LaunchToken;
use crate::error::{DownloadError, DownloadResult};

use super::archive::{materialize, ArchiveFormat};
use super::download::{existing_len, CancelToken, TransferOptions, TransferSession};
use super::manager::{ArtifactDescriptor, ExtraFile};
use super::metadata::{ensure_free_space, verify_sha256};
use super::transport::Transport;

/// Everything a scheduler persists to (re)launch one download job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobParams {
    pub model_name: String,
    pub display_name: String,
    pub url: String,
    pub version: String,
    pub file_name: String,
    pub is_archive: bool,
    #[serde(default)]
    pub archive_format: ArchiveFormat,
    #[serde(default)]
    pub archive_dir: Option<String>,
    #[serde(default)]
    pub extra_files: Vec<ExtraFile>,
    /// Primary file size.
    #[serde(default)]
    pub size_bytes: u64,
    /// Across primary and extras; zero when unknown.
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub launch_token: LaunchToken,
}

impl JobParams {
    pub fn for_descriptor(descriptor: &ArtifactDescriptor, auth_token: Option<String>) -> Self {
        Self {
            model_name: descriptor.name.clone(),
            display_name: descriptor.title().to_string(),
            url: descriptor.url.clone(),
            version: descriptor.version.clone(),
            file_name: descriptor.file_name.clone(),
            is_archive: descriptor.is_archive,
            archive_format: descriptor.archive_format,
            archive_dir: descriptor.archive_dir.clone(),
            extra_files: descriptor.extra_files.clone(),
            size_bytes: descriptor.size_bytes,
            total_bytes: descriptor.total_bytes(),
            sha256: descriptor.sha256.clone(),
            auth_token: auth_token.or_else(|| descriptor.auth_token.clone()),
            launch_token: LaunchToken::current(),
        }
    }

    /// Rebuilds the descriptor so on-disk paths come from the same layout the catalogue uses.
    #[must_use]
    pub fn descriptor(&self) -> ArtifactDescriptor {
        ArtifactDescriptor {
            name: self.model_name.clone(),
            display_name: Some(self.display_name.clone()),
            url: self.url.clone(),
            version: self.version.clone(),
            file_name: self.file_name.clone(),
            size_bytes: self.size_bytes,
            is_archive: self.is_archive,
            archive_format: self.archive_format,
            archive_dir: self.archive_dir.clone(),
            sha256: self.sha256.clone(),
            auth_token: self.auth_token.clone(),
            extra_files: self.extra_files.clone(),
            imported: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure { error: String },
    /// Stopped by the supervisor; partial files stay for a later resume.
    Cancelled,
}

/// Runs one download job end to end against a [`JobHost`].
pub struct DownloadWorker<'a> {
    transport: &'a dyn Transport,
    root: PathBuf,
    options: TransferOptions,
    check_free_space: bool,
    cancel: CancelToken,
}

impl<'a> DownloadWorker<'a> {
    pub fn new(transport: &'a dyn Transport, root: PathBuf, options: TransferOptions) -> Self {
        Self {
            transport,
            root,
            options,
            check_free_space: true,
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_free_space_check(mut self, enabled: bool) -> Self {
        self.check_free_space = enabled;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Never returns an error: every failure becomes [`JobOutcome::Failure`].
    pub fn run(&self, params: &JobParams, host: &dyn JobHost) -> JobOutcome {
        if !params.launch_token.is_current() {
            info!(
                "skipping stale download job for {} from an earlier launch",
                params.model_name
            );
            return JobOutcome::Success;
        }

        let attempt = Uuid::new_v4();
        let span = info_span!("download", model = %params.model_name, %attempt);
        let _guard = span.enter();

        info!("download job started: {}", params.url);
        match self.execute(params, host) {
            Ok(()) => {
                info!("download job finished");
                JobOutcome::Success
            }
            Err(DownloadError::Cancelled) => {
                info!("download job cancelled, partial files kept");
                JobOutcome::Cancelled
            }
            Err(error) => {
                warn!("download job failed: {error}");
                JobOutcome::Failure {
                    error: error.to_string(),
                }
            }
        }
    }

    fn execute(&self, params: &JobParams, host: &dyn JobHost) -> DownloadResult<()> {
        if params.url.is_empty() {
            return Err(DownloadError::MissingSource(params.model_name.clone()));
        }

        host.start_foreground(&ForegroundNotice::starting(&params.display_name))
            .map_err(|err| DownloadError::Foreground(format!("{err:#}")))?;

        let descriptor = params.descriptor();
        let transfers = descriptor.transfers(&self.root, None);
        if self.check_free_space {
            let on_disk = transfers
                .iter()
                .map(|t| existing_len(&t.destination))
                .sum::<DownloadResult<u64>>()?;
            let dir = descriptor.version_dir(&self.root);
            std::fs::create_dir_all(&dir)
                .map_err(|err| DownloadError::io(format!("create {}", dir.display()), err))?;
            ensure_free_space(&dir, params.total_bytes.saturating_sub(on_disk))?;
        }

        let title = params.display_name.as_str();
        let total = params.total_bytes;
        let received = TransferSession::new(self.transport, self.options)
            .with_cancel(self.cancel.clone())
            .run(&transfers, total, |snapshot| {
                host.publish_progress(&ProgressData::Transfer {
                    received_bytes: snapshot.received_bytes,
                    bytes_per_second: snapshot.bytes_per_second,
                    remaining_ms: snapshot.remaining_ms,
                });
                host.update_foreground(&ForegroundNotice::progress(
                    title,
                    snapshot.received_bytes,
                    total,
                ));
            })?;

        // Unthrottled: observers must see the full byte count before success.
        host.publish_progress(&ProgressData::Transfer {
            received_bytes: received,
            bytes_per_second: 0,
            remaining_ms: 0,
        });

        let primary = &transfers[0].destination;
        if let Some(expected) = &params.sha256 {
            verify_sha256(primary, expected)?;
        }

        if let Some(destination) = descriptor.archive_dir_path(&self.root) {
            host.publish_progress(&ProgressData::Unzipping);
            materialize(primary, &destination, params.archive_format)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::io::Write;

    use parking_lot::Mutex;

    use std::path::Path;

    use super::super::manager::sample_descriptor;
    use super::super::transport::testing::MemoryTransport;
    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingHost {
        pub notices: Mutex<Vec<ForegroundNotice>>,
        pub progress: Mutex<Vec<ProgressData>>,
        pub refuse_foreground: bool,
    }

    impl JobHost for RecordingHost {
        fn start_foreground(&self, notice: &ForegroundNotice) -> anyhow::Result<()> {
            if self.refuse_foreground {
                anyhow::bail!("foreground service not allowed");
            }
            self.notices.lock().push(notice.clone());
            Ok(())
        }

        fn update_foreground(&self, notice: &ForegroundNotice) {
            self.notices.lock().push(notice.clone());
        }

        fn publish_progress(&self, data: &ProgressData) {
            self.progress.lock().push(data.clone());
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn worker<'a>(transport: &'a MemoryTransport, root: &Path) -> DownloadWorker<'a> {
        DownloadWorker::new(
            transport,
            root.to_path_buf(),
            TransferOptions {
                chunk_size: 16,
                ..TransferOptions::default()
            },
        )
        .with_free_space_check(false)
    }

    #[test]
    fn stale_job_succeeds_without_io() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new(vec![]);
        let host = RecordingHost::default();
        let mut params = JobParams::for_descriptor(&sample_descriptor("gemma"), None);
        params.launch_token = LaunchToken(params.launch_token.0 - 60_000);

        let outcome = worker(&transport, dir.path()).run(&params, &host);

        assert_eq!(outcome, JobOutcome::Success);
        assert_eq!(transport.request_count(), 0);
        assert!(host.notices.lock().is_empty());
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn resumed_job_reaches_total_before_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = sample_descriptor("gemma");
        descriptor.size_bytes = 1000;
        descriptor.extra_files.clear();
        let model = payload(1000);

        let params = JobParams::for_descriptor(&descriptor, Some("hf_token".into()));
        let path = descriptor.primary_path(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, &model[..400]).unwrap();

        let transport = MemoryTransport::new(vec![(descriptor.url.as_str(), model.clone())]);
        let host = RecordingHost::default();
        let outcome = worker(&transport, dir.path()).run(&params, &host);

        assert_eq!(outcome, JobOutcome::Success);
        assert_eq!(fs::read(&path).unwrap(), model);
        let request = transport.requests.lock()[0].clone();
        assert_eq!(request.resume_from, 400);
        assert_eq!(request.auth_token.as_deref(), Some("hf_token"));

        let progress = host.progress.lock();
        let received: Vec<u64> = progress
            .iter()
            .filter_map(|p| match p {
                ProgressData::Transfer { received_bytes, .. } => Some(*received_bytes),
                ProgressData::Unzipping => None,
            })
            .collect();
        assert_eq!(received.last().copied(), Some(1000));
        assert!(received.windows(2).all(|w| w[0] <= w[1]));
        assert!(received[0] > 400);

        let notices = host.notices.lock();
        assert_eq!(notices[0].title, "Downloading Gemma 3 1B");
        assert!(notices.iter().all(|n| n.ongoing));
    }

    #[test]
    fn archive_job_expands_and_signals_unzipping() {
        let dir = tempfile::tempdir().unwrap();
        let mut zip_bytes = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            writer
                .start_file("labels/labels.txt", zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(b"cat").unwrap();
            writer.finish().unwrap();
        }

        let mut descriptor = sample_descriptor("classifier");
        descriptor.url = "https://example.test/classifier.zip".into();
        descriptor.file_name = "classifier.zip".into();
        descriptor.size_bytes = zip_bytes.len() as u64;
        descriptor.is_archive = true;
        descriptor.archive_dir = Some("expanded".into());
        descriptor.extra_files.clear();

        let transport = MemoryTransport::new(vec![(descriptor.url.as_str(), zip_bytes)]);
        let host = RecordingHost::default();
        let params = JobParams::for_descriptor(&descriptor, None);
        let outcome = worker(&transport, dir.path()).run(&params, &host);

        assert_eq!(outcome, JobOutcome::Success);
        assert!(!descriptor.primary_path(dir.path()).exists());
        let expanded = descriptor.archive_dir_path(dir.path()).unwrap();
        assert_eq!(fs::read(expanded.join("labels/labels.txt")).unwrap(), b"cat");
        assert_eq!(host.progress.lock().last(), Some(&ProgressData::Unzipping));
    }

    #[test]
    fn transport_failure_becomes_failure_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MemoryTransport::new(vec![]);
        transport.status_override = Some(401);
        let host = RecordingHost::default();
        let params = JobParams::for_descriptor(&sample_descriptor("gemma"), None);

        match worker(&transport, dir.path()).run(&params, &host) {
            JobOutcome::Failure { error } => assert!(error.contains("401"), "{error}"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn checksum_mismatch_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = sample_descriptor("gemma");
        descriptor.extra_files.clear();
        descriptor.size_bytes = 10;
        descriptor.sha256 = Some("00".into());
        let transport = MemoryTransport::new(vec![(descriptor.url.as_str(), payload(10))]);
        let host = RecordingHost::default();

        let outcome = worker(&transport, dir.path())
            .run(&JobParams::for_descriptor(&descriptor, None), &host);
        assert!(matches!(outcome, JobOutcome::Failure { error } if error.contains("checksum")));
    }

    #[test]
    fn refused_foreground_registration_fails_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new(vec![]);
        let host = RecordingHost {
            refuse_foreground: true,
            ..RecordingHost::default()
        };
        let outcome = worker(&transport, dir.path())
            .run(&JobParams::for_descriptor(&sample_descriptor("gemma"), None), &host);
        assert!(matches!(outcome, JobOutcome::Failure { .. }));
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn cancelled_job_reports_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = sample_descriptor("gemma");
        let transport = MemoryTransport::new(vec![(descriptor.url.as_str(), payload(100))]);
        let host = RecordingHost::default();
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = worker(&transport, dir.path())
            .with_cancel(cancel)
            .run(&JobParams::for_descriptor(&descriptor, None), &host);
        assert_eq!(outcome, JobOutcome::Cancelled);
    }

    #[test]
    fn params_round_trip_through_json() {
        let params = JobParams::for_descriptor(&sample_descriptor("Gemma3-1B"), None);
        assert_eq!(
            params.descriptor().version_dir(Path::new("/models")),
            Path::new("/models/Gemma3_1B/abc123")
        );
        assert_eq!(params.total_bytes, 120);
        let json = serde_json::to_string(&params).unwrap();
        let parsed: JobParams = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, params);
        assert!(parsed.launch_token.is_current());
    }
}

mod archive;
mod download;
mod lifecycle;
mod manager;
mod metadata;
mod progress;
mod service;
mod transport;
mod worker;

pub use archive::{materialize, ArchiveFormat};
pub use download::{
    existing_len, filename_from_uri, CancelToken, FileTransfer, TransferOptions, TransferSession,
};
pub use lifecycle::{LifecycleManager, ModelInstance};
pub use manager::{normalized_name, ArtifactDescriptor, ExtraFile, ModelManager, IMPORTED_VERSION};
pub use metadata::{available_space, compute_sha256, ensure_free_space, verify_sha256};
pub use progress::{remaining_ms, ProgressSnapshot, ThroughputWindow};
pub use service::{ModelDownloadJob, ModelDownloadService};
pub use transport::{ContentRange, HttpTransport, TransferRequest, Transport, TransportResponse};
pub use worker::{DownloadWorker, JobOutcome, JobParams};

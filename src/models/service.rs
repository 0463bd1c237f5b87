use std::{collections::HashMap, path::PathBuf, sync::Arc, thread};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::events::{ForegroundNotice, JobHost, ProgressData};
use crate::core::settings::DownloadSettings;
use crate::core::status::{StatusStore, TransferStatus};

use super::download::{CancelToken, TransferOptions};
use super::manager::ModelManager;
use super::transport::{HttpTransport, Transport};
use super::worker::{DownloadWorker, JobOutcome, JobParams};

#[derive(Debug, Clone)]
pub struct ModelDownloadJob {
    pub name: String,
    pub auth_token: Option<String>,
}

type CancelMap = Arc<Mutex<HashMap<String, CancelToken>>>;

/// In-process job supervisor: one background thread, jobs run strictly in order.
#[derive(Clone)]
pub struct ModelDownloadService {
    sender: Sender<JobParams>,
    manager: Arc<Mutex<ModelManager>>,
    store: Arc<StatusStore>,
    cancels: CancelMap,
}

struct WorkerContext {
    transport: Arc<dyn Transport>,
    manager: Arc<Mutex<ModelManager>>,
    store: Arc<StatusStore>,
    cancels: CancelMap,
    root: PathBuf,
    options: TransferOptions,
    check_free_space: bool,
}

impl ModelDownloadService {
    pub fn new(
        settings: &DownloadSettings,
        manager: Arc<Mutex<ModelManager>>,
        store: Arc<StatusStore>,
    ) -> Result<Self> {
        let transport = HttpTransport::new(settings).context("create http client")?;
        Ok(Self::with_transport(
            Arc::new(transport),
            settings,
            manager,
            store,
        ))
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        settings: &DownloadSettings,
        manager: Arc<Mutex<ModelManager>>,
        store: Arc<StatusStore>,
    ) -> Self {
        let (sender, receiver) = unbounded();
        let cancels: CancelMap = Arc::new(Mutex::new(HashMap::new()));
        let context = WorkerContext {
            transport,
            manager: manager.clone(),
            store: store.clone(),
            cancels: cancels.clone(),
            root: manager.lock().root().to_path_buf(),
            options: TransferOptions::from(settings),
            check_free_space: settings.check_free_space,
        };
        thread::spawn(move || worker_loop(receiver, context));
        Self {
            sender,
            manager,
            store,
            cancels,
        }
    }

    pub fn store(&self) -> Arc<StatusStore> {
        self.store.clone()
    }

    /// Seeds every artifact's observable state from disk.
    pub fn refresh_status(&self) -> Result<()> {
        let manager = self.manager.lock();
        for descriptor in manager.descriptors() {
            if self.store.get(&descriptor.name).status.is_active() {
                continue;
            }
            let (status, on_disk) = manager.scan_status(descriptor)?;
            self.store
                .reset(&descriptor.name, status, on_disk, descriptor.total_bytes());
        }
        Ok(())
    }

    /// Queues a download; a job already queued or running for the same model is left alone.
    pub fn queue(&self, job: ModelDownloadJob) -> Result<()> {
        let params = {
            let manager = self.manager.lock();
            let descriptor = manager
                .descriptor(&job.name)
                .ok_or_else(|| anyhow!("unknown model {}", job.name))?;
            JobParams::for_descriptor(descriptor, job.auth_token)
        };

        {
            let mut cancels = self.cancels.lock();
            if cancels.contains_key(&params.model_name) {
                debug!("{} already queued", params.model_name);
                return Ok(());
            }
            cancels.insert(params.model_name.clone(), CancelToken::new());
        }

        self.store
            .begin_attempt(&params.model_name, params.total_bytes);
        self.sender
            .send(params)
            .context("send model download job to worker")
    }

    /// Returns `false` when nothing was queued or running for `name`.
    pub fn cancel(&self, name: &str) -> bool {
        match self.cancels.lock().get(name) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        self.cancel(name);
        let mut manager = self.manager.lock();
        if let Some(descriptor) = manager.delete(name)? {
            if !descriptor.imported {
                self.store
                    .reset(name, TransferStatus::NotStarted, 0, descriptor.total_bytes());
            }
        }
        Ok(())
    }
}

fn worker_loop(receiver: Receiver<JobParams>, context: WorkerContext) {
    for params in receiver.iter() {
        let name = params.model_name.clone();
        let cancel = context
            .cancels
            .lock()
            .get(&name)
            .cloned()
            .unwrap_or_default();

        let outcome = if cancel.is_cancelled() {
            JobOutcome::Cancelled
        } else {
            let host = StoreHost {
                store: &context.store,
                name: &name,
                total_bytes: params.total_bytes,
            };
            DownloadWorker::new(&*context.transport, context.root.clone(), context.options)
                .with_free_space_check(context.check_free_space)
                .with_cancel(cancel)
                .run(&params, &host)
        };
        context.cancels.lock().remove(&name);

        match outcome {
            JobOutcome::Success => context.store.mark_succeeded(&name),
            JobOutcome::Failure { error } => context.store.mark_failed(&name, error),
            JobOutcome::Cancelled => on_cancelled(&context, &name),
        }
    }
}

fn on_cancelled(context: &WorkerContext, name: &str) {
    let manager = context.manager.lock();
    let Some(descriptor) = manager.descriptor(name) else {
        return;
    };
    match manager.scan_status(descriptor) {
        Ok((status, on_disk)) => {
            context
                .store
                .reset(name, status, on_disk, descriptor.total_bytes());
        }
        Err(error) => {
            warn!("Failed to rescan {name} after cancel: {error:?}");
            context.store.mark_partial(name);
        }
    }
}

/// Feeds worker progress into the status store and logs the foreground notice.
struct StoreHost<'a> {
    store: &'a StatusStore,
    name: &'a str,
    total_bytes: u64,
}

impl JobHost for StoreHost<'_> {
    fn start_foreground(&self, notice: &ForegroundNotice) -> Result<()> {
        info!("{}: {}", notice.title, notice.text);
        self.store.begin_attempt(self.name, self.total_bytes);
        Ok(())
    }

    fn update_foreground(&self, notice: &ForegroundNotice) {
        debug!("{}: {}", notice.title, notice.text);
    }

    fn publish_progress(&self, data: &ProgressData) {
        match data {
            ProgressData::Transfer {
                received_bytes,
                bytes_per_second,
                remaining_ms,
            } => self.store.apply_progress(
                self.name,
                *received_bytes,
                *bytes_per_second,
                *remaining_ms,
            ),
            ProgressData::Unzipping => self.store.mark_unzipping(self.name),
        }
    }
}

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    NotStarted,
    PartiallyDownloaded,
    InProgress,
    Unzipping,
    Succeeded,
    Failed,
}

impl TransferStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Unzipping)
    }

    /// Forward-only within an attempt; a new attempt may start from any idle state.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (_, Failed) => true,
            (InProgress, InProgress) => true,
            (InProgress, Unzipping | Succeeded | PartiallyDownloaded) => true,
            (Unzipping, Succeeded) => true,
            (NotStarted | PartiallyDownloaded | Succeeded | Failed, InProgress) => true,
            (NotStarted | PartiallyDownloaded | Succeeded | Failed, NotStarted) => true,
            (NotStarted | PartiallyDownloaded | Failed, PartiallyDownloaded | Succeeded) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferState {
    pub status: TransferStatus,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: u64,
    pub remaining_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TransferState {
    #[must_use]
    pub fn new(status: TransferStatus) -> Self {
        Self {
            status,
            received_bytes: 0,
            total_bytes: 0,
            bytes_per_second: 0,
            remaining_ms: 0,
            error_message: None,
        }
    }

    /// Integer percent, `None` when the total is unknown.
    #[must_use]
    pub fn percent(&self) -> Option<u8> {
        percent_of(self.received_bytes, self.total_bytes)
    }
}

impl Default for TransferState {
    fn default() -> Self {
        Self::new(TransferStatus::NotStarted)
    }
}

#[must_use]
pub fn percent_of(received: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let ratio = (received as f64 / total as f64).clamp(0.0, 1.0);
    Some((ratio * 100.0) as u8)
}

/// Per-artifact observable download state.
///
/// Writers are the download worker and the service that owns it; everyone else
/// reads through [`StatusStore::subscribe`] or [`StatusStore::get`].
#[derive(Default)]
pub struct StatusStore {
    channels: Mutex<HashMap<String, watch::Sender<TransferState>>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, name: &str) -> watch::Receiver<TransferState> {
        self.with_sender(name, |sender| sender.subscribe())
    }

    pub fn get(&self, name: &str) -> TransferState {
        self.with_sender(name, |sender| sender.borrow().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Seeds the state from what is on disk, without validating the transition.
    pub fn reset(&self, name: &str, status: TransferStatus, received_bytes: u64, total_bytes: u64) {
        self.with_sender(name, |sender| {
            sender.send_replace(TransferState {
                received_bytes,
                total_bytes,
                ..TransferState::new(status)
            });
        });
    }

    pub fn begin_attempt(&self, name: &str, total_bytes: u64) {
        self.transition(name, TransferStatus::InProgress, |state| {
            state.total_bytes = total_bytes;
            state.bytes_per_second = 0;
            state.remaining_ms = 0;
            state.error_message = None;
        });
    }

    pub fn apply_progress(
        &self,
        name: &str,
        received_bytes: u64,
        bytes_per_second: u64,
        remaining_ms: u64,
    ) {
        self.transition(name, TransferStatus::InProgress, |state| {
            state.received_bytes = state.received_bytes.max(received_bytes);
            state.bytes_per_second = bytes_per_second;
            state.remaining_ms = remaining_ms;
        });
    }

    pub fn mark_unzipping(&self, name: &str) {
        self.transition(name, TransferStatus::Unzipping, |_| {});
    }

    pub fn mark_succeeded(&self, name: &str) {
        self.transition(name, TransferStatus::Succeeded, |state| {
            if state.total_bytes > 0 {
                state.received_bytes = state.total_bytes;
            }
            state.remaining_ms = 0;
            state.error_message = None;
        });
    }

    pub fn mark_partial(&self, name: &str) {
        self.transition(name, TransferStatus::PartiallyDownloaded, |state| {
            state.bytes_per_second = 0;
            state.remaining_ms = 0;
        });
    }

    pub fn mark_failed(&self, name: &str, message: impl Into<String>) {
        let message = message.into();
        self.transition(name, TransferStatus::Failed, |state| {
            state.bytes_per_second = 0;
            state.remaining_ms = 0;
            state.error_message = Some(message);
        });
    }

    fn transition<F>(&self, name: &str, next: TransferStatus, update: F)
    where
        F: FnOnce(&mut TransferState),
    {
        self.with_sender(name, |sender| {
            sender.send_if_modified(|state| {
                if !state.status.can_transition_to(next) {
                    warn!(
                        "ignoring status change for {name}: {:?} -> {:?}",
                        state.status, next
                    );
                    return false;
                }
                if next == TransferStatus::InProgress && state.status != TransferStatus::InProgress
                {
                    state.received_bytes = 0;
                }
                state.status = next;
                update(state);
                true
            });
        });
    }

    fn with_sender<T>(&self, name: &str, f: impl FnOnce(&watch::Sender<TransferState>) -> T) -> T {
        let mut channels = self.channels.lock();
        let sender = channels
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(TransferState::default()).0);
        f(sender)
    }
}

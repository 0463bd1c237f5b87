use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

static PROCESS_LAUNCH: Lazy<LaunchToken> = Lazy::new(|| {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    LaunchToken(millis as i64)
});

/// Identifies the process instance that scheduled a job.
///
/// A job carrying a token from an earlier process is stale and must not touch
/// the filesystem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct LaunchToken(pub i64);

impl LaunchToken {
    pub fn current() -> Self {
        *PROCESS_LAUNCH
    }

    #[must_use]
    pub fn is_current(self) -> bool {
        self == Self::current()
    }
}

use serde::Serialize;
use serde_json::{Map, Value};

use super::status::percent_of;

pub const KEY_RECEIVED_BYTES: &str = "received_bytes";
pub const KEY_DOWNLOAD_RATE: &str = "download_rate";
pub const KEY_REMAINING_MS: &str = "remaining_ms";
pub const KEY_START_UNZIPPING: &str = "start_unzipping";
pub const KEY_ERROR_MESSAGE: &str = "error_message";

pub const NOTIFICATION_CHANNEL: &str = "model_download_channel";

/// Progress published through the job host's key/value data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressData {
    Transfer {
        received_bytes: u64,
        bytes_per_second: u64,
        remaining_ms: u64,
    },
    Unzipping,
}

impl ProgressData {
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            ProgressData::Transfer {
                received_bytes,
                bytes_per_second,
                remaining_ms,
            } => {
                map.insert(KEY_RECEIVED_BYTES.into(), Value::from(*received_bytes));
                map.insert(KEY_DOWNLOAD_RATE.into(), Value::from(*bytes_per_second));
                map.insert(KEY_REMAINING_MS.into(), Value::from(*remaining_ms));
            }
            ProgressData::Unzipping => {
                map.insert(KEY_START_UNZIPPING.into(), Value::Bool(true));
            }
        }
        map
    }

    pub fn from_map(map: &Map<String, Value>) -> Option<Self> {
        if map
            .get(KEY_START_UNZIPPING)
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Some(ProgressData::Unzipping);
        }
        let received_bytes = map.get(KEY_RECEIVED_BYTES)?.as_u64()?;
        let field = |key: &str| map.get(key).and_then(Value::as_u64).unwrap_or(0);
        Some(ProgressData::Transfer {
            received_bytes,
            bytes_per_second: field(KEY_DOWNLOAD_RATE),
            remaining_ms: field(KEY_REMAINING_MS),
        })
    }
}

/// Long-running task notice: silent, low importance, not dismissable while the job runs.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForegroundNotice {
    pub channel: &'static str,
    pub title: String,
    pub text: String,
    pub percent: Option<u8>,
    pub ongoing: bool,
}

impl ForegroundNotice {
    pub fn starting(title: &str) -> Self {
        Self {
            channel: NOTIFICATION_CHANNEL,
            title: format!("Downloading {title}"),
            text: "Download starting".into(),
            percent: None,
            ongoing: true,
        }
    }

    pub fn progress(title: &str, received: u64, total: u64) -> Self {
        let percent = percent_of(received, total);
        let text = match percent {
            Some(value) => format!("Download in progress: {value}%"),
            None => "Download in progress".into(),
        };
        Self {
            channel: NOTIFICATION_CHANNEL,
            title: format!("Downloading {title}"),
            text,
            percent,
            ongoing: true,
        }
    }
}

/// Boundary with whatever supervises download jobs.
pub trait JobHost: Send + Sync {
    /// Registers the job as long-running before any byte moves.
    fn start_foreground(&self, notice: &ForegroundNotice) -> anyhow::Result<()>;

    fn update_foreground(&self, notice: &ForegroundNotice);

    /// Fire-and-forget; must not block on I/O.
    fn publish_progress(&self, data: &ProgressData);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_progress_uses_stable_keys() {
        let data = ProgressData::Transfer {
            received_bytes: 400,
            bytes_per_second: 2048,
            remaining_ms: 300,
        };
        let map = data.to_map();
        assert_eq!(map[KEY_RECEIVED_BYTES], Value::from(400u64));
        assert_eq!(map[KEY_DOWNLOAD_RATE], Value::from(2048u64));
        assert_eq!(map[KEY_REMAINING_MS], Value::from(300u64));
        assert!(!map.contains_key(KEY_START_UNZIPPING));
        assert_eq!(ProgressData::from_map(&map), Some(data));
    }

    #[test]
    fn unzipping_flag_wins_over_byte_counts() {
        let mut map = ProgressData::Unzipping.to_map();
        map.insert(KEY_RECEIVED_BYTES.into(), Value::from(5u64));
        assert_eq!(ProgressData::from_map(&map), Some(ProgressData::Unzipping));
        assert_eq!(ProgressData::from_map(&Map::new()), None);
    }

    #[test]
    fn notice_text_shows_integer_percent() {
        let notice = ForegroundNotice::progress("Gemma 3 1B", 333, 1000);
        assert_eq!(notice.percent, Some(33));
        assert_eq!(notice.text, "Download in progress: 33%");
        assert!(notice.ongoing);

        let unknown = ForegroundNotice::progress("Gemma 3 1B", 333, 0);
        assert_eq!(unknown.percent, None);
    }
}

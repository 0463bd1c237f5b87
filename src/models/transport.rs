use std::io::Read;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderName, CONTENT_LENGTH, CONTENT_RANGE, RANGE};

use crate::core::settings::DownloadSettings;
use crate::error::{DownloadError, DownloadResult};

pub const STATUS_OK: u16 = 200;
pub const STATUS_PARTIAL_CONTENT: u16 = 206;
pub const STATUS_RANGE_NOT_SATISFIABLE: u16 = 416;

static CONTENT_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*bytes\s+(?:(\d+)-(\d+)|\*)/(\d+|\*)\s*$").expect("valid content-range regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub resume_from: u64,
    pub auth_token: Option<String>,
}

/// Parsed `Content-Range` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let captures = CONTENT_RANGE_RE.captures(value)?;
        let number = |index: usize| {
            captures
                .get(index)
                .and_then(|m| m.as_str().parse::<u64>().ok())
        };
        Some(Self {
            start: number(1),
            end: number(2),
            total: number(3),
        })
    }
}

pub struct TransportResponse {
    pub status: u16,
    pub content_range: Option<ContentRange>,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_range", &self.content_range)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Opens one GET for a transfer; implementations report the raw status and leave
/// status policy to the session.
pub trait Transport: Send + Sync {
    fn open(&self, request: &TransferRequest) -> DownloadResult<TransportResponse>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(settings: &DownloadSettings) -> DownloadResult<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout())
            .timeout(None)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|source| DownloadError::Request {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: &TransferRequest) -> DownloadResult<TransportResponse> {
        let mut builder = self.client.get(&request.url);
        if request.resume_from > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", request.resume_from));
        }
        if let Some(token) = &request.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().map_err(|source| DownloadError::Request {
            url: request.url.clone(),
            source,
        })?;

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        let content_range = header(CONTENT_RANGE).and_then(|value| ContentRange::parse(&value));
        let content_length = header(CONTENT_LENGTH).and_then(|value| value.parse::<u64>().ok());

        Ok(TransportResponse {
            status: response.status().as_u16(),
            content_range,
            content_length,
            body: Box::new(response),
        })
    }
}

/// In-memory stand-in for a range-capable HTTP server.
#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Cursor, Read};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RangeMode {
        Honor,
        Ignore,
        /// Answer every resume from this fixed offset.
        From(u64),
    }

    pub struct MemoryTransport {
        files: Vec<(String, Vec<u8>)>,
        pub range_mode: RangeMode,
        pub status_override: Option<u16>,
        /// Fail the body read after this many bytes.
        pub fail_after: Option<usize>,
        pub read_delay: Option<Duration>,
        pub chunk_limit: Option<usize>,
        pub requests: Mutex<Vec<TransferRequest>>,
    }

    impl MemoryTransport {
        pub fn new(files: Vec<(&str, Vec<u8>)>) -> Self {
            Self {
                files: files
                    .into_iter()
                    .map(|(url, bytes)| (url.to_string(), bytes))
                    .collect(),
                range_mode: RangeMode::Honor,
                status_override: None,
                fail_after: None,
                read_delay: None,
                chunk_limit: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    impl Transport for MemoryTransport {
        fn open(&self, request: &TransferRequest) -> DownloadResult<TransportResponse> {
            self.requests.lock().push(request.clone());
            let empty = || TransportResponse {
                status: 0,
                content_range: None,
                content_length: Some(0),
                body: Box::new(Cursor::new(Vec::new())),
            };
            if let Some(status) = self.status_override {
                return Ok(TransportResponse { status, ..empty() });
            }
            let Some((_, payload)) = self.files.iter().find(|(url, _)| url == &request.url) else {
                return Ok(TransportResponse { status: 404, ..empty() });
            };
            let total = payload.len() as u64;
            let start = match self.range_mode {
                RangeMode::Honor => request.resume_from,
                RangeMode::Ignore => 0,
                RangeMode::From(offset) if request.resume_from > 0 => offset,
                RangeMode::From(_) => 0,
            };
            if start > 0 && start >= total {
                return Ok(TransportResponse {
                    status: STATUS_RANGE_NOT_SATISFIABLE,
                    content_range: Some(ContentRange {
                        start: None,
                        end: None,
                        total: Some(total),
                    }),
                    ..empty()
                });
            }
            let body = payload[start as usize..].to_vec();
            let (status, content_range) = if start > 0 {
                (
                    STATUS_PARTIAL_CONTENT,
                    Some(ContentRange {
                        start: Some(start),
                        end: Some(total - 1),
                        total: Some(total),
                    }),
                )
            } else {
                (STATUS_OK, None)
            };
            Ok(TransportResponse {
                status,
                content_range,
                content_length: Some(body.len() as u64),
                body: Box::new(ScriptedBody {
                    inner: Cursor::new(body),
                    served: 0,
                    fail_after: self.fail_after,
                    delay: self.read_delay,
                    chunk_limit: self.chunk_limit,
                }),
            })
        }
    }

    struct ScriptedBody {
        inner: Cursor<Vec<u8>>,
        served: usize,
        fail_after: Option<usize>,
        delay: Option<Duration>,
        chunk_limit: Option<usize>,
    }

    impl Read for ScriptedBody {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let mut limit = buf.len();
            if let Some(chunk) = self.chunk_limit {
                limit = limit.min(chunk);
            }
            if let Some(fail_after) = self.fail_after {
                if self.served >= fail_after {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
                }
                limit = limit.min(fail_after - self.served);
            }
            let read = self.inner.read(&mut buf[..limit])?;
            self.served += read;
            Ok(read)
        }
    }
}

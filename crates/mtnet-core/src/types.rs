//! Request/response data model: contexts, task metadata, results.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

/// Opaque caller payload carried from the request context into the result.
pub type UserContext = Arc<dyn Any + Send + Sync>;

/// Supported request kinds. HTTP(S) supports all of them; FTP supports
/// Get, Put, Upload and Download only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Get,
    Post,
    Put,
    Delete,
    Head,
    /// Upload a file or in-memory bytes (PUT or POST per [`UploadConfig`]).
    Upload,
    /// Download to a file. With `thread_count != 1` this routes to the
    /// multi-segment engine.
    Download,
    /// Multi-segment download: N concurrent Range requests into one
    /// memory-mapped destination.
    MtDownload,
}

impl RequestKind {
    /// Human-readable name used in log and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Get => "GET",
            RequestKind::Post => "POST",
            RequestKind::Put => "PUT",
            RequestKind::Delete => "DELETE",
            RequestKind::Head => "HEAD",
            RequestKind::Upload => "Upload",
            RequestKind::Download => "Download",
            RequestKind::MtDownload => "MT Download",
        }
    }

    /// True for the kinds that write a local file.
    pub fn is_download(&self) -> bool {
        matches!(self, RequestKind::Download | RequestKind::MtDownload)
    }
}

/// Header map with case-insensitive lookup and preserved insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace (case-insensitive). A replaced header keeps its
    /// original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut map = HeaderMap::new();
        for (n, v) in iter {
            map.insert(n, v);
        }
        map
    }
}

/// A cookie forwarded to the HTTP driver on each exchange.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Task metadata assigned by the manager. Ids are process-monotonic and
/// start at 1; 0 means "none" (no batch / no session).
#[derive(Debug, Clone, Default)]
pub struct TaskData {
    pub id: u64,
    pub batch_id: u64,
    pub session_id: u64,
    /// When true and any batch member fails, the remaining members of the
    /// batch are cancelled and the batch reply terminates on that failure.
    pub abort_batch_on_failed: bool,
    pub create_time: Option<SystemTime>,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
}

/// Per-request behavior options.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub show_progress: bool,
    /// Retry transient failures with bounded exponential backoff. Only
    /// applied to idempotent kinds (Get, Head, single-stream Download).
    pub retry_on_failed: bool,
    /// Maximum number of 301/302 hops followed before failing.
    pub max_redirects: u16,
    /// Whole-transfer timeout enforced by the HTTP driver.
    pub transfer_timeout_ms: u64,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            show_progress: false,
            retry_on_failed: false,
            max_redirects: 3,
            transfer_timeout_ms: 30_000,
        }
    }
}

/// Download destination configuration.
#[derive(Debug, Clone, Default)]
pub struct DownloadConfig {
    /// Explicit save name; when empty the name is derived from the URL.
    pub save_file_name: String,
    /// Target directory (required; created if missing).
    pub save_dir: PathBuf,
    /// Replace an existing destination instead of appending `_1`..`_99`.
    pub overwrite: bool,
    /// Segment count for the multi-segment path. 0 selects the CPU core
    /// count; the multi-segment engine clamps to at least 2.
    pub thread_count: u16,
}

/// Upload source configuration.
#[derive(Debug, Clone, Default)]
pub struct UploadConfig {
    /// File to upload; when `None`, `data` is used as the body.
    pub file_path: Option<PathBuf>,
    /// In-memory body used when no file path is set.
    pub data: Vec<u8>,
    /// Use PUT instead of POST (FTP always uploads via PUT semantics).
    pub use_put_method: bool,
    /// Assemble a multipart/form-data body from `files` and `kv_pairs`.
    pub use_form_data: bool,
    pub files: Vec<PathBuf>,
    pub kv_pairs: Vec<(String, String)>,
}

/// Input for one request. Immutable once submitted; the manager fills the
/// `task` ids and timestamps.
#[derive(Clone)]
pub struct RequestContext {
    pub kind: RequestKind,
    /// http(s) or ftp URL. For FTP uploads the URL names the remote file.
    pub url: String,
    pub headers: HeaderMap,
    /// Textual body for Post/Put (e.g. form-encoded pairs or JSON).
    pub body: String,
    pub cookies: Vec<Cookie>,
    pub task: TaskData,
    pub behavior: Behavior,
    pub download: Option<DownloadConfig>,
    pub upload: Option<UploadConfig>,
    pub user_context: Option<UserContext>,
}

impl RequestContext {
    pub fn new(kind: RequestKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            headers: HeaderMap::new(),
            body: String::new(),
            cookies: Vec::new(),
            task: TaskData::default(),
            behavior: Behavior::default(),
            download: None,
            upload: None,
            user_context: None,
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

/// Transfer statistics attached to each result.
#[derive(Debug, Clone, Copy, Default)]
pub struct Performance {
    pub duration_ms: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Output of one request (or a synthetic cancellation notice).
///
/// `success` implies an empty `error_message`; `cancelled` implies
/// `!success`.
#[derive(Clone, Default)]
pub struct ResponseResult {
    pub success: bool,
    pub cancelled: bool,
    pub error_message: String,
    pub body: Vec<u8>,
    pub headers: HeaderMap,
    pub task: TaskData,
    pub user_context: Option<UserContext>,
    pub performance: Performance,
}

impl ResponseResult {
    /// Body interpreted as UTF-8 (lossy). Convenience for textual APIs.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl std::fmt::Debug for ResponseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseResult")
            .field("success", &self.success)
            .field("cancelled", &self.cancelled)
            .field("error_message", &self.error_message)
            .field("body_len", &self.body.len())
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

//! Multi-channel network request library.
//!
//! A process-wide [`manager::RequestManager`] owns a bounded worker pool and
//! executes HTTP(S)/FTP requests concurrently: single tasks, batches sharing
//! one reply handle, and sessions as an orthogonal cancellation scope. Large
//! downloads can be split into disjoint byte ranges fetched in parallel and
//! written into a shared memory-mapped destination file.
//!
//! Call [`manager::RequestManager::initialize`] once before submitting any
//! request and [`manager::RequestManager::uninitialize`] before process exit.

pub mod config;
pub mod logging;

pub mod manager;
pub mod mapping;
pub mod naming;
pub mod request;
pub mod retry;
pub mod segmenter;
pub mod transfer;
pub mod types;

pub use manager::{Reply, ReplyEvent, RequestManager};
pub use types::{
    Behavior, Cookie, DownloadConfig, HeaderMap, Performance, RequestContext, RequestKind,
    ResponseResult, TaskData, UploadConfig,
};

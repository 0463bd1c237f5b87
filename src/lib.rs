//! Resumable model downloads for on-device inference.
//!
//! A [`models::ModelDownloadService`] runs download jobs one after another on a
//! background thread. Each job resumes whatever is already on disk, streams the
//! rest with throttled progress, optionally expands an archive, and reports its
//! state through a [`core::status::StatusStore`].

pub mod core;
pub mod error;
pub mod models;

pub use error::{DownloadError, DownloadResult};

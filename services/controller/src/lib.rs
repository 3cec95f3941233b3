//! Demo controller built on the reconciliation engine.
//!
//! Watches a directory of JSON manifests and mirrors every object into an
//! output directory. Deleting a manifest removes its mirror; editing one
//! rewrites it.

pub mod config;
pub mod file_source;
pub mod mirror;

pub use config::Config;
pub use file_source::FileSource;
pub use mirror::MirrorReconciler;

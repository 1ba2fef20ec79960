//! Object store adapters (cAdapter)
//!
//! Submodules:
//! - `client`: the `ObjectBackend` trait and the `ObjectClient` wrapper used by
//!   the image store
//! - `localfs`: a local directory standing in for a bucket
//! - `s3`: anonymous S3-compatible backend built on `aws-sdk-s3`
//!
//! Backends only ever read: disk images are immutable objects and all writes
//! stay in the image store's overlay.
pub mod client;
pub mod localfs;
pub mod s3;

//! Artifact storage for generated audio and video.
//!
//! [`R2Client`] talks to Cloudflare R2 through the S3 API. [`LocalArtifactStore`]
//! keeps artifacts on disk for local development and tests.

pub mod client;
pub mod error;
pub mod local;
pub mod store;

pub use client::{R2Client, R2Config};
pub use error::{StorageError, StorageResult};
pub use local::LocalArtifactStore;
pub use store::{keys, validate_key, ArtifactStore, StoredArtifact};

//! Business logic services.

pub mod submission;

pub use submission::{Deleted, Quote, SubmissionService, TaskRequest, VoiceParamsInput};

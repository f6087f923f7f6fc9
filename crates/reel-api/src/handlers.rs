//! Request handlers.

pub mod credits;
pub mod health;
pub mod tasks;

pub use credits::*;
pub use health::*;
pub use tasks::*;

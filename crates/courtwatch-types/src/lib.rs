//! Shared domain types for the courtwatch project.

pub mod config;
pub mod dates;
pub mod history;
pub mod session;
pub mod slot;

mod errors;

pub use errors::{CourtwatchError, Result};

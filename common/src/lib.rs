//! Common utilities and abstractions for the cogroup workspace.
//!
//! This module provides the error taxonomy and configuration types shared by
//! the shuffle engine and its harness.

pub mod config;
pub mod error;

pub use config::{ShuffleConfig, ShuffleConfigBuilder};
pub use error::{CogroupError, ErrorCategory, Result};

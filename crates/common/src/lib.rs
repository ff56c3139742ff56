//! Common utilities for usb-facade
//!
//! This crate provides the ambient pieces shared by the command-line front
//! end and anything else embedding the facade library: the crate-wide error
//! type and the tracing subscriber setup.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::{VALID_LOG_LEVELS, is_valid_log_level, setup_logging};

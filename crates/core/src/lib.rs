//! Core functionality shared by the TrustClient crates.
//!
//! This crate provides configuration loading, logging bootstrap and the
//! core error type used across the TrustClient workspace.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{ClientConfig, Endpoints};
pub use error::{CoreError, Result};

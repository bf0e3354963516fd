//! BlockVault Common - Shared types and utilities
//!
//! This crate provides the object identity types, error definitions and
//! configuration structures shared by the BlockVault storage engine and its
//! hosts.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

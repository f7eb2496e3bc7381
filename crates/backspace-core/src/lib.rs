//! # backspace-core
//!
//! Core types for the Backspace sandboxed change pipeline.
//!
//! A caller submits a natural-language change request against a repository;
//! the pipeline clones it into an isolated workspace, iterates
//! generate → apply → validate, and publishes the accepted diff.
//!
//! This crate holds what every other crate agrees on:
//! - Job, edit set, attempt and outcome types
//! - The unified error type and the terminal abort taxonomy
//! - Repository-level configuration
//! - Fail-open helpers for best-effort infrastructure work

pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::BackspaceConfig;
pub use error::{BackspaceError, Result};
pub use types::*;

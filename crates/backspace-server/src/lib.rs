//! # backspace-server
//!
//! HTTP transport for the job service: submit, list, inspect and cancel
//! jobs, and follow a job's progress events over Server-Sent Events with
//! replay from a sequence offset.

mod server;
mod sse;

pub use server::{router, serve, ApiError, AppState, SharedState};

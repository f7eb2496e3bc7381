//! Backspace orchestration
//!
//! - [`state_machine`]: pure job state transitions
//! - [`events`]: per-job ordered progress events with replay
//! - [`AgentLoop`]: runs one job through generate/apply/validate and publish
//! - [`JobService`]: concurrent submission, status and cancellation

pub mod agent_loop;
pub mod events;
pub mod service;
pub mod state_machine;

pub use agent_loop::{AgentLoop, JobReport};
pub use events::{EventEmitter, EventHub, EventKind, ProgressEvent, StreamItem, Subscription};
pub use service::{JobService, JobStatus};
pub use state_machine::{transition, JobState, LoopEvent};

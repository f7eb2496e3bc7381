//! Patch generator adapters for Backspace
//!
//! The agent loop only knows the [`PatchGenerator`] trait. This crate
//! provides the LLM-backed implementation ([`LlmGenerator`]), its prompt and
//! response handling, a shared [`CircuitBreaker`], and [`ScriptedGenerator`]
//! for tests.

pub mod circuit_breaker;
pub mod generator;
pub mod llm;
pub mod prompt;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use generator::{GenerationRequest, PatchGenerator, RecordedRequest, ScriptStep, ScriptedGenerator};
pub use llm::LlmGenerator;
pub use prompt::{build_prompt, parse_response};

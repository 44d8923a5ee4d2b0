//! `intellindex-runtime` – The report workflow engine.
//!
//! Drives the generate → review → refine → finalize cycle and exposes it as a
//! service.
//!
//! # Modules
//!
//! - [`workflow`] – [`WorkflowEngine`][workflow::WorkflowEngine]: the
//!   persisted-state machine.  Each transition maps a
//!   [`WorkflowRun`][workflow::WorkflowRun] plus an optional reviewer decision
//!   to the next run; suspension at human review is simply returning before
//!   the terminal step.
//! - [`service`] – [`IntelligentIndex`][service::IntelligentIndex]: the
//!   facade with `submit`/`resume`, durable checkpoints, per-namespace
//!   serialization, and direct accessors for the instruction, STM and
//!   archive tiers.
//! - [`optimizer`] –
//!   [`MetapromptOptimizer`][optimizer::MetapromptOptimizer]: rewrites a
//!   namespace's instructions after a feedback-driven run is approved.
//! - [`llm_driver`] – [`LlmDriver`][llm_driver::LlmDriver]: an
//!   OpenAI-compatible HTTP client that communicates with local models such as
//!   [Ollama](https://ollama.com) (`http://localhost:11434`) or hosted
//!   endpoints with an API key.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to Jaeger, Grafana Tempo, or any OTLP-compatible collector.

pub mod llm_driver;
pub mod optimizer;
pub mod service;
pub mod telemetry;
pub mod workflow;

pub use llm_driver::{LlmDriver, LlmError};
pub use optimizer::{InstructionOptimizer, MetapromptOptimizer, Trajectory};
pub use service::{Backends, IndexConfig, IntelligentIndex};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use workflow::{EngineDeps, EngineSettings, Step, WorkflowEngine, WorkflowRun, WorkflowState};

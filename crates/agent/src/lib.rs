//! Caseflow agent runtime.
//!
//! Turns a customer message into a concrete outcome:
//! 1. **Classification** (`classifier`) - message to intent, goal and decision type
//! 2. **Planning** (`planner`) - intent to a validated step plan built from templates
//! 3. **Execution** (`executor`) - runs the plan against the `tools` registry,
//!    escalating through the step's fallback on the first failed expectation
//! 4. **Orchestration** (`runtime`) - ties the three together and records the interaction
//!
//! Tools talk to the CX system through `adapters`; the bundled `backend` is an
//! in-memory stand-in seeded from fixtures.
//!
//! # Safety Principle
//!
//! The classifier only picks an intent. Which tools run, in what order, and
//! what counts as success is fixed by the plan templates.

pub mod adapters;
pub mod backend;
pub mod classifier;
pub mod executor;
pub mod llm;
pub mod planner;
pub mod runtime;
pub mod tools;

pub use executor::{CancelHandle, CancelSignal, ExecutionOptions, ExecutionResult, PlanExecutor};
pub use runtime::{AgentResponse, AgentRuntime, RequestOptions, ResponseStatus};

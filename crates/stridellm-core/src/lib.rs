//! StrideLLM Core - serving core for LLM inference
//!
//! This crate provides the components between request intake and the model
//! forward pass:
//! - A priority scheduler that plans one atomic tick at a time
//! - A paged cache manager with prefix sharing, compressed eviction
//!   snapshots and cross-worker migration
//! - Speculative decoding with draft trees and token-identity verification
//! - Structured decoding through grammar-derived token masks
//!
//! The forward pass itself sits behind the [`ComputeStep`] trait.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod execution;
pub mod grammar;
pub mod memory;
pub mod registry;
pub mod scheduler;
pub mod testing;

pub mod error;
pub mod types;

pub use config::{CacheConfig, EngineConfig, SchedulerConfig, SpeculativeConfig};
pub use engine::{Engine, EngineStats};
pub use error::{Error, MigrationError, Result};
pub use execution::{ComputeStep, PlanEntry, SequenceOutput, StepPlan, StepResult};
pub use registry::Registry;
pub use scheduler::{IntakeHandle, Scheduler, TickSummary};
pub use types::{
    Priority, RequestId, SequenceId, SequenceState, SequenceStatus, SubmitRequest, TokenId,
    WorkerId,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::execution::{ComputeStep, DraftProposer, StepPlan, StepResult};
    pub use crate::grammar::GrammarSpec;
    pub use crate::registry::Registry;
    pub use crate::types::*;
}

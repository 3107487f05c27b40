//! Distributed inference: task descriptions, the consensus engine for
//! replicated results, the local execution boundary, and the coordinator
//! that plans and drives tasks across the mesh.

pub mod consensus;
pub mod coordinator;
pub mod executor;
pub mod task;

pub use consensus::{ConsensusEngine, ConsensusOutcome};
pub use coordinator::{InferenceCoordinator, ShardDispatcher};
pub use executor::{InferenceExecutor, MockExecutor};
pub use task::{InferenceReport, InferenceTask, TaskState};

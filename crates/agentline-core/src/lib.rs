//! Agentline Core
//!
//! Streaming query pipeline between clients and an external agent runtime:
//! the in-flight query registry, the thread-to-async runtime bridge, the
//! incremental frame normalizer and the query orchestrator that ties them
//! together.

pub mod collab;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod normalizer;
pub mod orchestrator;
pub mod paths;
pub mod registry;
pub mod runtime;
pub mod types;

pub use error::{BridgeError, QueryError, RuntimeError};
pub use events::{EventEnvelope, QueryEvent};
pub use orchestrator::{Collaborators, QueryOrchestrator, QueryRequest};
pub use registry::QueryRegistry;

//! The weir pipeline core.
//!
//! A pipeline is a DAG of long-lived nodes. Each node runs its own task and
//! repeatedly waits for predecessor signals, does its work, signals its
//! successors, waits for their acknowledgements, and signals its
//! predecessors. That bidirectional handshake is what enforces run
//! boundaries across the whole graph, including across processes.
//!
//! This crate owns the handshake machinery (latches, node cores, the three
//! archetype loops), the abstract metadata-store interface, the event bus,
//! and the pipeline topology/lifecycle. Everything HTTP lives in
//! `weir-server`; concrete stores live in `weir-metastore` and `weir-nodes`.

pub mod errors;
pub mod events;
pub mod latch;
pub mod node;
pub mod pipeline;

pub use weir_api::status::{BaseType, NodeResult, NodeStatus};

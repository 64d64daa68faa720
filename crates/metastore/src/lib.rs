//! Metadata store backends.
//!
//! The pipeline core only consumes the abstract
//! [`MetadataStore`](weir_pipeline::node::MetadataStore) interface; this
//! crate provides the shipped implementations: a SQLite store for real
//! deployments and an in-memory store for tests and throwaway pipelines.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryMetadataStore;
pub use sqlite::SqliteMetadataStore;

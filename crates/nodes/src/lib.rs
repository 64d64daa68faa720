//! Concrete node building blocks: artifact stores that plug into the
//! pipeline core's resource nodes.

pub mod filesystem;

pub use filesystem::{FilesystemError, FilesystemStore, SavedArtifact};

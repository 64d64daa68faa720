//! Helpful types

use serde::{Deserialize, Serialize};
use smartstring::{LazyCompact, SmartString};
use std::{borrow::Borrow, fmt::Display};

/// A node's name.
/// Unique within a pipeline, and used as a routing key across the
/// federated graph.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeLabel {
	x: SmartString<LazyCompact>,
}

impl NodeLabel {
	/// Make a new node label
	pub fn new(name: &str) -> Self {
		Self { x: name.into() }
	}

	/// Get the name
	pub fn name(&self) -> &str {
		&self.x
	}
}

impl Display for NodeLabel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.x.fmt(f)
	}
}

impl From<String> for NodeLabel {
	fn from(value: String) -> Self {
		Self::new(&value)
	}
}

impl From<&str> for NodeLabel {
	fn from(value: &str) -> Self {
		Self::new(value)
	}
}

impl Borrow<str> for NodeLabel {
	fn borrow(&self) -> &str {
		&self.x
	}
}

/// A pipeline's name
#[derive(Debug, Hash, PartialEq, Eq, Clone, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PipelineName {
	x: SmartString<LazyCompact>,
}

impl PipelineName {
	/// Make a new pipeline name
	pub fn new(name: &str) -> Self {
		Self { x: name.into() }
	}

	/// Get the name
	pub fn name(&self) -> &str {
		&self.x
	}
}

impl Display for PipelineName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.x.fmt(f)
	}
}

impl From<&str> for PipelineName {
	fn from(value: &str) -> Self {
		Self::new(value)
	}
}

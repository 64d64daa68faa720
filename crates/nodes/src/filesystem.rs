//! A filesystem-backed artifact store: one watched directory.

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use weir_pipeline::{
	errors::HookError,
	node::{ArtifactStore, DiscoveredArtifact},
};
use weir_util::hash::hash_file;

const TMP_SUFFIX: &str = ".tmp";
const TMP_TOKEN_LENGTH: usize = 8;

/// An error while saving or loading an artifact on disk.
#[derive(Debug, Error)]
pub enum FilesystemError {
	#[error("i/o error")]
	Io(#[from] std::io::Error),

	/// The destination exists and `overwrite` was false
	#[error("artifact `{0}` already exists")]
	AlreadyExists(String),

	/// No artifact at this location
	#[error("artifact `{0}` does not exist")]
	NotFound(String),

	/// This store's directory is being watched; writing into it would be
	/// picked up by the monitor as a foreign artifact
	#[error("cannot save artifacts into a monitored store")]
	SaveWhileMonitored,
}

/// What `save_artifact` produced.
#[derive(Debug, Clone)]
pub struct SavedArtifact {
	pub location: String,
	pub hash: String,
	pub size: i64,
}

/// A directory of artifacts.
///
/// A *watched* store (the default) is scanned by its resource node's
/// monitor, and refuses `save_artifact`. An unwatched store (see
/// [`FilesystemStore::writable`]) is for nodes that only produce
/// artifacts, like a model registry; pair it with
/// `ResourceNode::without_monitoring`.
pub struct FilesystemStore {
	root: PathBuf,
	watched: bool,
}

impl FilesystemStore {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self {
			root: root.into(),
			watched: true,
		}
	}

	/// Allow `save_artifact` on this store.
	pub fn writable(mut self) -> Self {
		self.watched = false;
		self
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn tmp_token() -> String {
		rand::thread_rng()
			.sample_iter(&Alphanumeric)
			.take(TMP_TOKEN_LENGTH)
			.map(char::from)
			.collect()
	}

	fn is_tmp_file(name: &str) -> bool {
		name.starts_with('.') && name.ends_with(TMP_SUFFIX)
	}

	/// Save an artifact at `location` (relative to the store root).
	///
	/// The `write` closure receives the path to write to. With
	/// `atomic = true` that path is a temp file next to the destination
	/// (`.<basename>.<unique>.tmp`); on success it is renamed into place in
	/// a single step, so readers never observe a half-written artifact.
	/// The finished file is hashed and returned; record it with
	/// `ResourceNode::record_current` to pin it into the active run.
	pub async fn save_artifact<F>(
		&self,
		location: &str,
		overwrite: bool,
		atomic: bool,
		write: F,
	) -> Result<SavedArtifact, FilesystemError>
	where
		F: FnOnce(&Path) -> std::io::Result<()>,
	{
		if self.watched {
			return Err(FilesystemError::SaveWhileMonitored);
		}

		let destination = self.root.join(location);
		if destination.exists() && !overwrite {
			return Err(FilesystemError::AlreadyExists(location.into()));
		}

		if let Some(parent) = destination.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		if atomic {
			let basename = destination
				.file_name()
				.map(|x| x.to_string_lossy().to_string())
				.unwrap_or_default();
			let tmp = destination.with_file_name(format!(
				".{basename}.{}{TMP_SUFFIX}",
				Self::tmp_token()
			));

			match write(&tmp) {
				Ok(()) => {
					// commit is a single same-directory rename
					tokio::fs::rename(&tmp, &destination).await?;
				}
				Err(error) => {
					let _ = tokio::fs::remove_file(&tmp).await;
					return Err(error.into());
				}
			}
		} else {
			write(&destination)?;
		}

		let hash = hash_file(&destination).await?;
		let size = tokio::fs::metadata(&destination).await?.len() as i64;

		info!(
			message = "Saved artifact",
			location,
			path = %destination.display(),
		);

		return Ok(SavedArtifact {
			location: location.into(),
			hash,
			size,
		});
	}

	/// Resolve an artifact for reading, verifying its content hash.
	///
	/// A mismatch against `expected_hash` is logged but not fatal: the
	/// path is still returned, since the file may legitimately be in the
	/// middle of being superseded.
	pub async fn load_artifact(
		&self,
		location: &str,
		expected_hash: Option<&str>,
	) -> Result<PathBuf, FilesystemError> {
		let path = self.root.join(location);
		if !path.exists() {
			return Err(FilesystemError::NotFound(location.into()));
		}

		if let Some(expected) = expected_hash {
			let actual = hash_file(&path).await?;
			if actual != expected {
				warn!(
					message = "Artifact hash mismatch",
					location,
					expected,
					actual,
				);
			}
		}

		return Ok(path);
	}
}

#[async_trait]
impl ArtifactStore for FilesystemStore {
	async fn init(&self) -> Result<(), HookError> {
		tokio::fs::create_dir_all(&self.root).await?;
		return Ok(());
	}

	async fn discover(&self) -> Result<Vec<DiscoveredArtifact>, HookError> {
		let root = self.root.clone();

		// the walk itself is blocking i/o
		let files = tokio::task::spawn_blocking(move || {
			let mut files = Vec::new();
			for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
				if !entry.file_type().is_file() {
					continue;
				}

				let name = entry.file_name().to_string_lossy();
				if Self::is_tmp_file(&name) {
					continue;
				}

				let location = match entry.path().strip_prefix(&root) {
					Ok(x) => x.to_string_lossy().to_string(),
					Err(_) => continue,
				};

				files.push((location, entry.path().to_path_buf()));
			}
			files
		})
		.await?;

		let mut artifacts = Vec::new();
		for (location, path) in files {
			let hash = match hash_file(&path).await {
				Ok(x) => x,
				Err(error) => {
					// the file may have been deleted mid-scan
					warn!(
						message = "Could not hash discovered file",
						location,
						%error,
					);
					continue;
				}
			};

			let size = tokio::fs::metadata(&path).await.map(|m| m.len() as i64).ok();

			artifacts.push(DiscoveredArtifact {
				location,
				hash,
				size,
				content_type: None,
			});
		}

		return Ok(artifacts);
	}

	fn resolve(&self, location: &str) -> PathBuf {
		self.root.join(location)
	}
}

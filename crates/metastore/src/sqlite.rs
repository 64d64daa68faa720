//! The SQLite metadata store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
	sqlite::{SqliteConnectOptions, SqlitePoolOptions},
	QueryBuilder, Row, SqlitePool,
};
use std::{collections::BTreeMap, str::FromStr};
use tracing::info;

use weir_api::{
	artifact::{ArtifactEntryModel, ArtifactState, MetricModel, NodeRecord, ParamModel, RunModel},
	labels::NodeLabel,
	rpc::{CreateEntryRequest, EntriesQuery, HistoryQuery},
	status::BaseType,
};
use weir_pipeline::node::{MetadataError, MetadataStore};

fn db_err<E: std::error::Error + Send + Sync + 'static>(error: E) -> MetadataError {
	MetadataError::Backend(Box::new(error))
}

fn state_to_str(state: ArtifactState) -> &'static str {
	match state {
		ArtifactState::New => "new",
		ArtifactState::Current => "current",
		ArtifactState::Old => "old",
	}
}

fn state_from_str(s: &str) -> ArtifactState {
	match s {
		"current" => ArtifactState::Current,
		"old" => ArtifactState::Old,
		_ => ArtifactState::New,
	}
}

fn base_type_to_str(base: BaseType) -> &'static str {
	match base {
		BaseType::MetadataStore => "metadata_store",
		BaseType::Resource => "resource",
		BaseType::Action => "action",
	}
}

fn base_type_from_str(s: &str) -> BaseType {
	match s {
		"metadata_store" => BaseType::MetadataStore,
		"resource" => BaseType::Resource,
		_ => BaseType::Action,
	}
}

/// A [`MetadataStore`] backed by one SQLite database.
///
/// The pool holds a single connection, so every write is serialized:
/// `add_node`, `create_entry`, `start_run` and `end_run` are linearizable
/// per store instance, as the handshake requires.
pub struct SqliteMetadataStore {
	pool: SqlitePool,
}

impl SqliteMetadataStore {
	/// Open (or create) a store at the given path.
	pub async fn connect(uri: &str) -> Result<Self, MetadataError> {
		let options = SqliteConnectOptions::from_str(uri)
			.map_err(db_err)?
			.create_if_missing(true);

		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.connect_with(options)
			.await
			.map_err(db_err)?;

		info!(message = "Opened sqlite metadata store", uri);
		return Ok(Self { pool });
	}

	/// Open a fresh in-memory store.
	pub async fn open_in_memory() -> Result<Self, MetadataError> {
		Self::connect("sqlite::memory:").await
	}

	async fn node_id(&self, node_name: &NodeLabel) -> Result<i64, MetadataError> {
		let row = sqlx::query("SELECT id FROM nodes WHERE node_name = ?;")
			.bind(node_name.name())
			.fetch_optional(&self.pool)
			.await
			.map_err(db_err)?;

		return match row {
			Some(row) => Ok(row.get("id")),
			None => Err(MetadataError::NoSuchNode(node_name.clone())),
		};
	}
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
	async fn init(&self) -> Result<(), MetadataError> {
		// One statement per query; sqlite prepares them individually.
		let statements = [
			"CREATE TABLE IF NOT EXISTS runs (
				run_id INTEGER PRIMARY KEY,
				start_time TEXT NOT NULL,
				end_time TEXT DEFAULT NULL
			);",
			"CREATE TABLE IF NOT EXISTS nodes (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				node_name TEXT NOT NULL UNIQUE,
				node_type TEXT NOT NULL,
				base_type TEXT NOT NULL,
				init_time TEXT NOT NULL
			);",
			"CREATE TABLE IF NOT EXISTS metrics (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				run_id INTEGER,
				node_id INTEGER,
				metric_name TEXT NOT NULL,
				metric_value REAL NOT NULL,
				FOREIGN KEY(run_id) REFERENCES runs(run_id),
				FOREIGN KEY(node_id) REFERENCES nodes(id)
			);",
			"CREATE TABLE IF NOT EXISTS params (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				run_id INTEGER,
				node_id INTEGER,
				param_name TEXT NOT NULL,
				param_value TEXT NOT NULL,
				FOREIGN KEY(run_id) REFERENCES runs(run_id),
				FOREIGN KEY(node_id) REFERENCES nodes(id)
			);",
			"CREATE TABLE IF NOT EXISTS tags (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				run_id INTEGER,
				node_id INTEGER,
				tag_name TEXT NOT NULL,
				tag_value TEXT NOT NULL,
				FOREIGN KEY(run_id) REFERENCES runs(run_id),
				FOREIGN KEY(node_id) REFERENCES nodes(id)
			);",
			"CREATE TABLE IF NOT EXISTS triggers (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				node_id INTEGER,
				trigger_time TEXT NOT NULL,
				message TEXT DEFAULT NULL,
				run_triggered INTEGER DEFAULT NULL,
				FOREIGN KEY(node_id) REFERENCES nodes(id)
			);",
			"CREATE TABLE IF NOT EXISTS artifacts (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				run_id INTEGER DEFAULT NULL,
				node_id INTEGER,
				location TEXT NOT NULL,
				created_at TEXT NOT NULL,
				end_time TEXT DEFAULT NULL,
				state TEXT NOT NULL DEFAULT 'new',
				hash TEXT DEFAULT NULL,
				hash_algorithm TEXT DEFAULT NULL,
				size INTEGER DEFAULT NULL,
				content_type TEXT DEFAULT NULL,
				FOREIGN KEY(run_id) REFERENCES runs(run_id),
				FOREIGN KEY(node_id) REFERENCES nodes(id)
			);",
		];

		for statement in statements {
			sqlx::query(statement)
				.execute(&self.pool)
				.await
				.map_err(db_err)?;
		}

		return Ok(());
	}

	async fn add_node(
		&self,
		node_name: &NodeLabel,
		node_type: &str,
		base_type: BaseType,
	) -> Result<(), MetadataError> {
		sqlx::query(
			"INSERT OR IGNORE INTO nodes(node_name, node_type, base_type, init_time)
			 VALUES (?, ?, ?, ?);",
		)
		.bind(node_name.name())
		.bind(node_type)
		.bind(base_type_to_str(base_type))
		.bind(Utc::now())
		.execute(&self.pool)
		.await
		.map_err(db_err)?;

		return Ok(());
	}

	async fn node_exists(&self, node_name: &NodeLabel) -> Result<bool, MetadataError> {
		let row = sqlx::query("SELECT COUNT(id) AS n FROM nodes WHERE node_name = ?;")
			.bind(node_name.name())
			.fetch_one(&self.pool)
			.await
			.map_err(db_err)?;

		return Ok(row.get::<i64, _>("n") > 0);
	}

	async fn get_node_id(&self, node_name: &NodeLabel) -> Result<i64, MetadataError> {
		self.node_id(node_name).await
	}

	async fn get_nodes_info(&self) -> Result<Vec<NodeRecord>, MetadataError> {
		let rows = sqlx::query("SELECT * FROM nodes;")
			.fetch_all(&self.pool)
			.await
			.map_err(db_err)?;

		return Ok(rows
			.into_iter()
			.map(|row| NodeRecord {
				id: row.get("id"),
				node_name: NodeLabel::new(row.get::<String, _>("node_name").as_str()),
				node_type: row.get("node_type"),
				base_type: base_type_from_str(row.get::<String, _>("base_type").as_str()),
				init_time: row.get("init_time"),
			})
			.collect());
	}

	async fn get_run_id(&self) -> Result<i64, MetadataError> {
		let row = sqlx::query("SELECT run_id, end_time FROM runs ORDER BY run_id DESC LIMIT 1;")
			.fetch_optional(&self.pool)
			.await
			.map_err(db_err)?;

		return match row {
			None => Ok(0),
			Some(row) => {
				let run_id: i64 = row.get("run_id");
				let end_time: Option<DateTime<Utc>> = row.get("end_time");

				// An open run is the active one; a closed run means the
				// next id is about to be used.
				match end_time {
					None => Ok(run_id),
					Some(_) => Ok(run_id + 1),
				}
			}
		};
	}

	async fn start_run(&self, run_id: i64) -> Result<(), MetadataError> {
		let start_time = Utc::now();
		let mut t = self.pool.begin().await.map_err(db_err)?;

		sqlx::query("INSERT INTO runs(run_id, start_time) VALUES (?, ?);")
			.bind(run_id)
			.bind(start_time)
			.execute(&mut *t)
			.await
			.map_err(db_err)?;

		sqlx::query(
			"UPDATE artifacts SET run_id = ?, state = 'current'
			 WHERE run_id IS NULL AND state = 'new';",
		)
		.bind(run_id)
		.execute(&mut *t)
		.await
		.map_err(db_err)?;

		// Claim the triggers that accumulated before this run
		sqlx::query(
			"UPDATE triggers SET run_triggered = ?
			 WHERE run_triggered IS NULL AND trigger_time <= ?;",
		)
		.bind(run_id)
		.bind(start_time)
		.execute(&mut *t)
		.await
		.map_err(db_err)?;

		t.commit().await.map_err(db_err)?;
		info!(message = "Started run", run_id);
		return Ok(());
	}

	async fn end_run(&self, run_id: i64) -> Result<(), MetadataError> {
		let end_time = Utc::now();
		let mut t = self.pool.begin().await.map_err(db_err)?;

		sqlx::query("UPDATE runs SET end_time = ? WHERE run_id = ? AND end_time IS NULL;")
			.bind(end_time)
			.bind(run_id)
			.execute(&mut *t)
			.await
			.map_err(db_err)?;

		sqlx::query(
			"UPDATE artifacts SET end_time = ?, state = 'old'
			 WHERE end_time IS NULL AND state = 'current';",
		)
		.bind(end_time)
		.execute(&mut *t)
		.await
		.map_err(db_err)?;

		t.commit().await.map_err(db_err)?;
		info!(message = "Ended run", run_id);
		return Ok(());
	}

	async fn get_runs(&self) -> Result<Vec<RunModel>, MetadataError> {
		let rows = sqlx::query("SELECT * FROM runs ORDER BY run_id;")
			.fetch_all(&self.pool)
			.await
			.map_err(db_err)?;

		return Ok(rows
			.into_iter()
			.map(|row| RunModel {
				run_id: row.get("run_id"),
				start_time: row.get("start_time"),
				end_time: row.get("end_time"),
			})
			.collect());
	}

	async fn create_entry(&self, entry: CreateEntryRequest) -> Result<(), MetadataError> {
		let node_id = self.node_id(&entry.resource_node_name).await?;

		sqlx::query(
			"INSERT INTO artifacts
				(run_id, node_id, location, created_at, state, hash, hash_algorithm, size, content_type)
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?);",
		)
		.bind(entry.run_id)
		.bind(node_id)
		.bind(&entry.location)
		.bind(Utc::now())
		.bind(state_to_str(entry.state))
		.bind(&entry.hash)
		.bind(&entry.hash_algorithm)
		.bind(entry.size)
		.bind(&entry.content_type)
		.execute(&self.pool)
		.await
		.map_err(db_err)?;

		return Ok(());
	}

	async fn entry_exists(
		&self,
		resource_node_name: &NodeLabel,
		location: &str,
	) -> Result<bool, MetadataError> {
		let node_id = self.node_id(resource_node_name).await?;

		let row = sqlx::query(
			"SELECT COUNT(id) AS n FROM artifacts WHERE node_id = ? AND location = ?;",
		)
		.bind(node_id)
		.bind(location)
		.fetch_one(&self.pool)
		.await
		.map_err(db_err)?;

		return Ok(row.get::<i64, _>("n") > 0);
	}

	async fn update_entry(
		&self,
		resource_node_name: &NodeLabel,
		entry_id: i64,
		state: ArtifactState,
		run_id: Option<i64>,
	) -> Result<(), MetadataError> {
		let node_id = self.node_id(resource_node_name).await?;

		let result = sqlx::query(
			"UPDATE artifacts SET state = ?, run_id = ? WHERE id = ? AND node_id = ?;",
		)
		.bind(state_to_str(state))
		.bind(run_id)
		.bind(entry_id)
		.bind(node_id)
		.execute(&self.pool)
		.await
		.map_err(db_err)?;

		if result.rows_affected() == 0 {
			return Err(MetadataError::NoSuchEntry(entry_id));
		}

		return Ok(());
	}

	async fn get_num_entries(
		&self,
		resource_node_name: &NodeLabel,
		state: Option<ArtifactState>,
	) -> Result<i64, MetadataError> {
		let node_id = self.node_id(resource_node_name).await?;

		let row = match state {
			None => sqlx::query("SELECT COUNT(id) AS n FROM artifacts WHERE node_id = ?;")
				.bind(node_id)
				.fetch_one(&self.pool)
				.await
				.map_err(db_err)?,
			Some(state) => {
				sqlx::query("SELECT COUNT(id) AS n FROM artifacts WHERE node_id = ? AND state = ?;")
					.bind(node_id)
					.bind(state_to_str(state))
					.fetch_one(&self.pool)
					.await
					.map_err(db_err)?
			}
		};

		return Ok(row.get("n"));
	}

	async fn get_entries(
		&self,
		query: EntriesQuery,
	) -> Result<Vec<ArtifactEntryModel>, MetadataError> {
		let mut qb: QueryBuilder<'_, sqlx::Sqlite> = QueryBuilder::new(
			"SELECT a.id, a.run_id, n.node_name, a.location, a.created_at, a.end_time,
				a.state, a.hash, a.hash_algorithm, a.size, a.content_type
			 FROM artifacts a JOIN nodes n ON n.id = a.node_id WHERE 1 = 1",
		);

		if let Some(name) = &query.resource_node_name {
			qb.push(" AND n.node_name = ").push_bind(name.name());
		}
		if let Some(state) = query.state {
			qb.push(" AND a.state = ").push_bind(state_to_str(state));
		}
		if let Some(run_id) = query.run_id {
			qb.push(" AND a.run_id = ").push_bind(run_id);
		}
		qb.push(" ORDER BY a.id;");

		let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;

		return Ok(rows
			.into_iter()
			.map(|row| ArtifactEntryModel {
				id: row.get("id"),
				run_id: row.get("run_id"),
				node_name: NodeLabel::new(row.get::<String, _>("node_name").as_str()),
				location: row.get("location"),
				created_at: row.get("created_at"),
				end_time: row.get("end_time"),
				state: state_from_str(row.get::<String, _>("state").as_str()),
				hash: row.get("hash"),
				hash_algorithm: row.get("hash_algorithm"),
				size: row.get("size"),
				content_type: row.get("content_type"),
			})
			.collect());
	}

	async fn merge_artifacts_table(
		&self,
		resource_node_name: &NodeLabel,
		entries: Vec<ArtifactEntryModel>,
	) -> Result<(), MetadataError> {
		let node_id = self.node_id(resource_node_name).await?;
		let mut t = self.pool.begin().await.map_err(db_err)?;

		for entry in entries {
			let existing =
				sqlx::query("SELECT id FROM artifacts WHERE node_id = ? AND location = ?;")
					.bind(node_id)
					.bind(&entry.location)
					.fetch_optional(&mut *t)
					.await
					.map_err(db_err)?;

			match existing {
				Some(row) => {
					sqlx::query(
						"UPDATE artifacts
						 SET run_id = ?, state = ?, end_time = ?, hash = ?, hash_algorithm = ?,
							size = ?, content_type = ?
						 WHERE id = ?;",
					)
					.bind(entry.run_id)
					.bind(state_to_str(entry.state))
					.bind(entry.end_time)
					.bind(&entry.hash)
					.bind(&entry.hash_algorithm)
					.bind(entry.size)
					.bind(&entry.content_type)
					.bind(row.get::<i64, _>("id"))
					.execute(&mut *t)
					.await
					.map_err(db_err)?;
				}
				None => {
					sqlx::query(
						"INSERT INTO artifacts
							(run_id, node_id, location, created_at, end_time, state,
							 hash, hash_algorithm, size, content_type)
						 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
					)
					.bind(entry.run_id)
					.bind(node_id)
					.bind(&entry.location)
					.bind(entry.created_at)
					.bind(entry.end_time)
					.bind(state_to_str(entry.state))
					.bind(&entry.hash)
					.bind(&entry.hash_algorithm)
					.bind(entry.size)
					.bind(&entry.content_type)
					.execute(&mut *t)
					.await
					.map_err(db_err)?;
				}
			}
		}

		t.commit().await.map_err(db_err)?;
		return Ok(());
	}

	async fn log_metrics(
		&self,
		node_name: &NodeLabel,
		metrics: BTreeMap<String, f64>,
	) -> Result<(), MetadataError> {
		let node_id = self.node_id(node_name).await?;
		let run_id = self.get_run_id().await?;
		let mut t = self.pool.begin().await.map_err(db_err)?;

		for (name, value) in metrics {
			sqlx::query(
				"INSERT INTO metrics(run_id, node_id, metric_name, metric_value)
				 VALUES (?, ?, ?, ?);",
			)
			.bind(run_id)
			.bind(node_id)
			.bind(&name)
			.bind(value)
			.execute(&mut *t)
			.await
			.map_err(db_err)?;
		}

		t.commit().await.map_err(db_err)?;
		return Ok(());
	}

	async fn log_params(
		&self,
		node_name: &NodeLabel,
		params: BTreeMap<String, String>,
	) -> Result<(), MetadataError> {
		let node_id = self.node_id(node_name).await?;
		let run_id = self.get_run_id().await?;
		let mut t = self.pool.begin().await.map_err(db_err)?;

		for (name, value) in params {
			sqlx::query(
				"INSERT INTO params(run_id, node_id, param_name, param_value)
				 VALUES (?, ?, ?, ?);",
			)
			.bind(run_id)
			.bind(node_id)
			.bind(&name)
			.bind(&value)
			.execute(&mut *t)
			.await
			.map_err(db_err)?;
		}

		t.commit().await.map_err(db_err)?;
		return Ok(());
	}

	async fn set_tags(
		&self,
		node_name: &NodeLabel,
		tags: BTreeMap<String, String>,
	) -> Result<(), MetadataError> {
		let node_id = self.node_id(node_name).await?;
		let run_id = self.get_run_id().await?;
		let mut t = self.pool.begin().await.map_err(db_err)?;

		for (name, value) in tags {
			sqlx::query(
				"INSERT INTO tags(run_id, node_id, tag_name, tag_value) VALUES (?, ?, ?, ?);",
			)
			.bind(run_id)
			.bind(node_id)
			.bind(&name)
			.bind(&value)
			.execute(&mut *t)
			.await
			.map_err(db_err)?;
		}

		t.commit().await.map_err(db_err)?;
		return Ok(());
	}

	async fn get_metrics(&self, query: HistoryQuery) -> Result<Vec<MetricModel>, MetadataError> {
		let mut qb: QueryBuilder<'_, sqlx::Sqlite> = QueryBuilder::new(
			"SELECT m.run_id, n.node_name, m.metric_name, m.metric_value
			 FROM metrics m JOIN nodes n ON n.id = m.node_id WHERE 1 = 1",
		);

		if let Some(name) = &query.node_name {
			qb.push(" AND n.node_name = ").push_bind(name.name());
		}
		if let Some(run_id) = query.run_id {
			qb.push(" AND m.run_id = ").push_bind(run_id);
		}
		qb.push(" ORDER BY m.id;");

		let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;

		return Ok(rows
			.into_iter()
			.map(|row| MetricModel {
				run_id: row.get("run_id"),
				node_name: NodeLabel::new(row.get::<String, _>("node_name").as_str()),
				name: row.get("metric_name"),
				value: row.get("metric_value"),
			})
			.collect());
	}

	async fn get_params(&self, query: HistoryQuery) -> Result<Vec<ParamModel>, MetadataError> {
		let mut qb: QueryBuilder<'_, sqlx::Sqlite> = QueryBuilder::new(
			"SELECT p.run_id, n.node_name, p.param_name, p.param_value
			 FROM params p JOIN nodes n ON n.id = p.node_id WHERE 1 = 1",
		);

		if let Some(name) = &query.node_name {
			qb.push(" AND n.node_name = ").push_bind(name.name());
		}
		if let Some(run_id) = query.run_id {
			qb.push(" AND p.run_id = ").push_bind(run_id);
		}
		qb.push(" ORDER BY p.id;");

		let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;

		return Ok(rows
			.into_iter()
			.map(|row| ParamModel {
				run_id: row.get("run_id"),
				node_name: NodeLabel::new(row.get::<String, _>("node_name").as_str()),
				name: row.get("param_name"),
				value: row.get("param_value"),
			})
			.collect());
	}

	async fn get_tags(&self, query: HistoryQuery) -> Result<Vec<ParamModel>, MetadataError> {
		let mut qb: QueryBuilder<'_, sqlx::Sqlite> = QueryBuilder::new(
			"SELECT t.run_id, n.node_name, t.tag_name, t.tag_value
			 FROM tags t JOIN nodes n ON n.id = t.node_id WHERE 1 = 1",
		);

		if let Some(name) = &query.node_name {
			qb.push(" AND n.node_name = ").push_bind(name.name());
		}
		if let Some(run_id) = query.run_id {
			qb.push(" AND t.run_id = ").push_bind(run_id);
		}
		qb.push(" ORDER BY t.id;");

		let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;

		return Ok(rows
			.into_iter()
			.map(|row| ParamModel {
				run_id: row.get("run_id"),
				node_name: NodeLabel::new(row.get::<String, _>("node_name").as_str()),
				name: row.get("tag_name"),
				value: row.get("tag_value"),
			})
			.collect());
	}

	async fn log_trigger(
		&self,
		node_name: &NodeLabel,
		message: Option<&str>,
	) -> Result<(), MetadataError> {
		let node_id = self.node_id(node_name).await?;

		sqlx::query("INSERT INTO triggers(node_id, trigger_time, message) VALUES (?, ?, ?);")
			.bind(node_id)
			.bind(Utc::now())
			.bind(message)
			.execute(&self.pool)
			.await
			.map_err(db_err)?;

		return Ok(());
	}
}

use super::clickhouse::ClickhouseClient;
use super::victorialogs::VictoriaLogsClient;
use super::*;
use crate::meta::{ConnectionInfo, Source};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BackendTuning {
	pub query_timeout: Duration,
	pub probe_timeout: Duration,
}

impl Default for BackendTuning {
	fn default() -> Self {
		Self {
			query_timeout: Duration::from_secs(60),
			probe_timeout: Duration::from_secs(5),
		}
	}
}

pub fn build_client(source: &Source, tuning: &BackendTuning) -> Result<Arc<dyn BackendClient>> {
	match &source.connection {
		ConnectionInfo::Sql(conn) => Ok(Arc::new(ClickhouseClient::new(
			conn,
			&source.ts_field,
			tuning.query_timeout,
		)?)),
		ConnectionInfo::Logsql(conn) => {
			Ok(Arc::new(VictoriaLogsClient::new(conn, tuning.query_timeout)?))
		}
	}
}

/// Per-backend-kind owner of clients and their health records. Adding a
/// source never blocks on the network: the client is constructed
/// synchronously and the first probe runs as its own task.
pub struct BackendManager {
	kind: BackendKind,
	tuning: BackendTuning,
	clients: RwLock<HashMap<SourceId, Arc<dyn BackendClient>>>,
	health: RwLock<HashMap<SourceId, SourceHealth>>,
	shutdown: watch::Sender<bool>,
	checker: Mutex<Option<JoinHandle<()>>>,
}

impl BackendManager {
	pub fn new(kind: BackendKind, tuning: BackendTuning) -> Self {
		let (shutdown, _) = watch::channel(false);
		Self {
			kind,
			tuning,
			clients: RwLock::new(HashMap::new()),
			health: RwLock::new(HashMap::new()),
			shutdown,
			checker: Mutex::new(None),
		}
	}

	pub fn kind(&self) -> BackendKind {
		self.kind
	}

	pub fn add_source(self: &Arc<Self>, source: &Source) -> Result<()> {
		if source.kind() != self.kind {
			return Err(BackendError::Internal(format!(
				"source {} is a {} source, this manager owns {} sources",
				source.id,
				source.kind(),
				self.kind
			)));
		}
		if self.clients.read().unwrap().contains_key(&source.id) {
			return Ok(());
		}
		let client = build_client(source, &self.tuning)?;
		{
			let mut clients = self.clients.write().unwrap();
			if clients.contains_key(&source.id) {
				return Ok(());
			}
			clients.insert(source.id, client.clone());
		}
		self.health
			.write()
			.unwrap()
			.insert(source.id, SourceHealth::pending());
		info!(source_id = source.id, kind = %self.kind, "source added");

		let mgr = Arc::clone(self);
		let id = source.id;
		tokio::spawn(async move {
			mgr.probe_one(id, client).await;
		});
		Ok(())
	}

	pub fn remove_source(&self, id: SourceId) {
		let client = self.clients.write().unwrap().remove(&id);
		self.health.write().unwrap().remove(&id);
		if let Some(client) = client {
			client.close();
			info!(source_id = id, kind = %self.kind, "source removed");
		}
	}

	pub fn get_client(&self, id: SourceId) -> Result<Arc<dyn BackendClient>> {
		self.clients
			.read()
			.unwrap()
			.get(&id)
			.cloned()
			.ok_or_else(|| BackendError::NotFound(format!("source {id} is not registered")))
	}

	/// In-place reconnect of one client, followed by a probe so the
	/// health record reflects the fresh connection.
	pub async fn reconnect_source(&self, id: SourceId) -> Result<()> {
		let client = self.get_client(id)?;
		client.reconnect().await?;
		self.probe_one(id, client).await;
		Ok(())
	}

	/// One live probe, then the latest cached record.
	pub async fn get_health(&self, id: SourceId) -> Result<SourceHealth> {
		let client = self.get_client(id)?;
		self.probe_one(id, client).await;
		self.get_cached_health(id)
			.ok_or_else(|| BackendError::NotFound(format!("source {id} is not registered")))
	}

	pub fn get_cached_health(&self, id: SourceId) -> Option<SourceHealth> {
		self.health.read().unwrap().get(&id).cloned()
	}

	/// Build and ping a client outside the pool, for validation flows.
	/// The caller owns (and closes) the returned client.
	pub async fn create_temporary_client(
		&self,
		source: &Source,
	) -> Result<Arc<dyn BackendClient>> {
		let client = build_client(source, &self.tuning)?;
		let probe = tokio::time::timeout(self.tuning.probe_timeout, client.ping()).await;
		match probe {
			Ok(Ok(())) => Ok(client),
			Ok(Err(e)) => {
				client.close();
				Err(e)
			}
			Err(_) => {
				client.close();
				Err(BackendError::Timeout(self.tuning.probe_timeout))
			}
		}
	}

	async fn probe_one(&self, id: SourceId, client: Arc<dyn BackendClient>) {
		let outcome =
			match tokio::time::timeout(self.tuning.probe_timeout, client.ping()).await {
				Ok(Ok(())) => Ok(()),
				Ok(Err(e)) => Err(e.to_string()),
				Err(_) => Err(format!(
					"health probe timed out after {:?}",
					self.tuning.probe_timeout
				)),
			};
		let now = chrono::Utc::now().naive_utc();
		let fresh = match outcome {
			Ok(()) => SourceHealth {
				status: HealthStatus::Healthy,
				last_checked: now,
				error: None,
			},
			Err(message) => SourceHealth {
				status: HealthStatus::Unhealthy,
				last_checked: now,
				error: Some(message),
			},
		};

		let mut health = self.health.write().unwrap();
		let previous = health.get(&id).map(|h| h.status);
		match (previous, fresh.status) {
			(Some(HealthStatus::Healthy), HealthStatus::Unhealthy) => {
				warn!(source_id = id, error = ?fresh.error, "source degraded");
			}
			(Some(HealthStatus::Unhealthy), HealthStatus::Healthy) => {
				debug!(source_id = id, "source recovered");
			}
			_ => {}
		}
		// the source may have been removed while the probe was in flight
		if previous.is_some() || self.clients.read().unwrap().contains_key(&id) {
			health.insert(id, fresh);
		}
	}

	pub fn start_background_health_checks(self: &Arc<Self>, interval: Duration) {
		let mgr = Arc::clone(self);
		let mut shutdown = self.shutdown.subscribe();
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			// the first tick fires immediately; skip it so startup probes
			// (from add_source) are not doubled
			ticker.tick().await;
			loop {
				tokio::select! {
					_ = ticker.tick() => {}
					_ = shutdown.changed() => break,
				}
				// snapshot ids under the lock, probe outside it
				let snapshot: Vec<(SourceId, Arc<dyn BackendClient>)> = mgr
					.clients
					.read()
					.unwrap()
					.iter()
					.map(|(id, client)| (*id, client.clone()))
					.collect();
				let mut probes = JoinSet::new();
				for (id, client) in snapshot {
					let mgr = Arc::clone(&mgr);
					probes.spawn(async move {
						mgr.probe_one(id, client).await;
					});
				}
				while probes.join_next().await.is_some() {}
			}
			debug!(kind = %mgr.kind, "background health checker stopped");
		});
		*self.checker.lock().unwrap() = Some(handle);
	}

	/// Stop the background checker (bounded drain), then close every
	/// client.
	pub async fn close(&self) {
		let _ = self.shutdown.send(true);
		let handle = self.checker.lock().unwrap().take();
		if let Some(mut handle) = handle {
			if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
				handle.abort();
			}
		}
		let clients: Vec<Arc<dyn BackendClient>> =
			self.clients.write().unwrap().drain().map(|(_, c)| c).collect();
		for client in clients {
			client.close();
		}
		self.health.write().unwrap().clear();
	}
}

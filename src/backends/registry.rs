use super::manager::{BackendManager, BackendTuning};
use super::*;
use crate::meta::Source;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// One façade over all backend kinds: maps a source id to the manager of
/// its kind and forwards. Never hands out a wrong-kind client.
pub struct BackendRegistry {
	sources: RwLock<HashMap<SourceId, BackendKind>>,
	managers: HashMap<BackendKind, Arc<BackendManager>>,
}

impl BackendRegistry {
	pub fn new(tuning: BackendTuning) -> Self {
		let managers = HashMap::from([
			(
				BackendKind::Sql,
				Arc::new(BackendManager::new(BackendKind::Sql, tuning.clone())),
			),
			(
				BackendKind::Logsql,
				Arc::new(BackendManager::new(BackendKind::Logsql, tuning)),
			),
		]);
		Self {
			sources: RwLock::new(HashMap::new()),
			managers,
		}
	}

	fn manager_for(&self, kind: BackendKind) -> Result<&Arc<BackendManager>> {
		self.managers.get(&kind).ok_or_else(|| {
			BackendError::Internal(format!("no manager registered for backend kind {kind}"))
		})
	}

	fn kind_of(&self, id: SourceId) -> Result<BackendKind> {
		self.sources
			.read()
			.unwrap()
			.get(&id)
			.copied()
			.ok_or_else(|| BackendError::NotFound(format!("source {id} is not registered")))
	}

	pub fn add_source(&self, source: &Source) -> Result<()> {
		let kind = source.kind();
		self.manager_for(kind)?.add_source(source)?;
		self.sources.write().unwrap().insert(source.id, kind);
		Ok(())
	}

	pub fn remove_source(&self, id: SourceId) -> Result<()> {
		let kind = self.kind_of(id)?;
		self.manager_for(kind)?.remove_source(id);
		self.sources.write().unwrap().remove(&id);
		Ok(())
	}

	pub fn get_client(&self, id: SourceId) -> Result<Arc<dyn BackendClient>> {
		let kind = self.kind_of(id)?;
		self.manager_for(kind)?.get_client(id)
	}

	pub async fn reconnect_source(&self, id: SourceId) -> Result<()> {
		let kind = self.kind_of(id)?;
		self.manager_for(kind)?.reconnect_source(id).await
	}

	pub async fn get_health(&self, id: SourceId) -> Result<SourceHealth> {
		let kind = self.kind_of(id)?;
		self.manager_for(kind)?.get_health(id).await
	}

	pub fn get_cached_health(&self, id: SourceId) -> Result<Option<SourceHealth>> {
		let kind = self.kind_of(id)?;
		Ok(self.manager_for(kind)?.get_cached_health(id))
	}

	pub async fn create_temporary_client(
		&self,
		source: &Source,
	) -> Result<Arc<dyn BackendClient>> {
		self.manager_for(source.kind())?
			.create_temporary_client(source)
			.await
	}

	pub fn start_background_health_checks(&self, interval: Duration) {
		for manager in self.managers.values() {
			manager.start_background_health_checks(interval);
		}
	}

	pub async fn close(&self) {
		for manager in self.managers.values() {
			manager.close().await;
		}
		self.sources.write().unwrap().clear();
	}
}

use crate::{backends::BackendRegistry, config, meta::MetaStore, metrics};
use moka::sync::Cache;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
	pub config: Arc<config::AppConfig>,
	pub meta: Arc<dyn MetaStore>,
	pub registry: Arc<BackendRegistry>,
	pub cache: Cache<String, Arc<Vec<u8>>>,
	pub metrics: Arc<metrics::Instrumentations>,
}

pub fn new_cache(cfg: &config::TranslateCache) -> Cache<String, Arc<Vec<u8>>> {
	Cache::builder()
		.max_capacity(cfg.max_capacity)
		.weigher(|_, v: &Arc<Vec<u8>>| v.len().try_into().unwrap_or(u32::MAX))
		.time_to_live(cfg.time_to_live)
		.time_to_idle(cfg.time_to_idle)
		.build()
}

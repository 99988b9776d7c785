use crate::{
	alerts::notify::{AlertmanagerSender, EmailSender, MultiSender, Sender, WebhookSender},
	alerts::AlertEvaluator,
	backends::{BackendRegistry, BackendTuning},
	config::AppConfig,
	meta::{MetaStore, SqliteStore},
	metrics, routes, state,
};
use anyhow::{Context, Result};
use std::{fs::OpenOptions, sync::Arc};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use validator::Validate;

pub async fn start() -> Result<()> {
	// load configuration
	let cfg = AppConfig::new().context("loading configuration")?;
	cfg.validate().context("validating configuration")?;

	init_tracing_subscriber(
		cfg.server.log.file.clone(),
		cfg.server.log.filter_directives.as_str(),
	);

	let metrics_handle = metrics::setup_metrics();
	let cache = state::new_cache(&cfg.query.cache);

	let meta: Arc<SqliteStore> = Arc::new(
		SqliteStore::open(&cfg.metastore.path)
			.map_err(|e| anyhow::anyhow!("opening metastore: {e}"))?,
	);

	let registry = Arc::new(BackendRegistry::new(BackendTuning {
		query_timeout: cfg.query.default_timeout,
		probe_timeout: cfg.backends.probe_timeout,
	}));
	for source in meta.list_sources().await.map_err(anyhow::Error::from)? {
		let id = source.id;
		if let Err(e) = registry.add_source(&source) {
			warn!(source_id = id, error = %e, "skipping source");
		}
	}
	registry.start_background_health_checks(cfg.backends.health_check_interval);

	let (shutdown_tx, _) = watch::channel(false);
	if cfg.alerts.enabled {
		let notifier = Arc::new(build_notifier(&cfg)?);
		if notifier.is_empty() {
			info!("alerting enabled with no notification channels configured");
		}
		let evaluator = Arc::new(AlertEvaluator::new(
			meta.clone(),
			registry.clone(),
			notifier,
			cfg.alerts.clone(),
		));
		evaluator.spawn(shutdown_tx.subscribe());
	}

	let app_state = state::AppState {
		config: Arc::new(cfg.clone()),
		meta,
		registry: registry.clone(),
		cache,
		metrics: Arc::new(metrics_handle),
	};
	let app = routes::new_router(app_state);

	let listener = tokio::net::TcpListener::bind(cfg.server.listen_addr.clone())
		.await
		.with_context(|| format!("binding {}", cfg.server.listen_addr))?;
	info!("Listening on: {}", cfg.server.listen_addr);
	axum::serve(listener, app).await?;

	let _ = shutdown_tx.send(true);
	registry.close().await;
	Ok(())
}

fn build_notifier(cfg: &AppConfig) -> Result<MultiSender> {
	let insecure = cfg.alerts.tls_insecure_skip_verify;
	let mut senders: Vec<Arc<dyn Sender>> = vec![];
	if let Some(smtp) = &cfg.alerts.smtp {
		senders.push(Arc::new(EmailSender::new(smtp.clone(), insecure)));
	}
	if let Some(url) = &cfg.alerts.webhook_url {
		senders.push(Arc::new(WebhookSender::new(
			url.clone(),
			cfg.alerts.request_timeout,
			insecure,
		)?));
	}
	if let Some(am) = &cfg.alertmanager {
		senders.push(Arc::new(AlertmanagerSender::new(
			&am.url,
			cfg.alerts.request_timeout,
			insecure,
		)?));
	}
	Ok(MultiSender::new(senders, cfg.alerts.request_timeout))
}

fn init_tracing_subscriber(file: String, filter_directives: &str) {
	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter_directives))
		.with(
			tracing_subscriber::fmt::layer()
				.json()
				.with_writer(move || get_writer(file.clone())),
		)
		.init();
}

fn get_writer(file: String) -> Box<dyn std::io::Write> {
	if file.as_str().eq_ignore_ascii_case("stdout") {
		Box::new(std::io::stdout())
	} else if file.as_str().eq_ignore_ascii_case("stderr") {
		Box::new(std::io::stderr())
	} else {
		Box::new(
			OpenOptions::new()
				.append(true)
				.create(true)
				.open(file)
				.expect("opening log file"),
		)
	}
}

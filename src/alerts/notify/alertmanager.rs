use super::{AlertNotification, NotifyStatus, Sender};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Alertmanager v2 sender: posts the alert array to
/// `<base>/api/v2/alerts` and probes `<base>/api/v2/status`.
pub struct AlertmanagerSender {
	base: String,
	client: reqwest::Client,
}

/// Accepts the bare base URL or the full `/api/v2/alerts` endpoint and
/// normalises to the base.
pub fn normalize_base_url(raw: &str) -> Result<String> {
	let trimmed = raw.trim().trim_end_matches('/');
	let base = trimmed
		.strip_suffix("/api/v2/alerts")
		.unwrap_or(trimmed)
		.trim_end_matches('/');
	url::Url::parse(base).with_context(|| format!("bad alertmanager url {raw}"))?;
	Ok(base.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AmAlert {
	pub labels: BTreeMap<String, String>,
	pub annotations: BTreeMap<String, String>,
	#[serde(rename = "startsAt")]
	pub starts_at: String,
	#[serde(rename = "endsAt", skip_serializing_if = "Option::is_none")]
	pub ends_at: Option<String>,
	#[serde(rename = "generatorURL", skip_serializing_if = "Option::is_none")]
	pub generator_url: Option<String>,
}

pub(crate) fn to_payload(n: &AlertNotification) -> Vec<AmAlert> {
	let mut labels = BTreeMap::from([
		("alertname".to_string(), n.alert_name.clone()),
		("severity".to_string(), n.severity.clone()),
		(
			"team".to_string(),
			n.team_name.clone().unwrap_or_else(|| n.team_id.to_string()),
		),
		(
			"source".to_string(),
			n.source_name
				.clone()
				.unwrap_or_else(|| n.source_id.to_string()),
		),
	]);
	labels.insert("status".to_string(), match n.status {
		NotifyStatus::Firing => "firing".to_string(),
		NotifyStatus::Resolved => "resolved".to_string(),
	});

	let mut annotations = BTreeMap::from([
		(
			"threshold".to_string(),
			format!("{} {}", n.threshold_operator, n.threshold_value),
		),
		("value".to_string(), n.value.to_string()),
	]);
	if let Some(description) = &n.description {
		annotations.insert("description".to_string(), description.clone());
	}
	if let Some(query) = &n.query {
		annotations.insert("query".to_string(), query.clone());
	}

	vec![AmAlert {
		labels,
		annotations,
		starts_at: n.triggered_at.clone(),
		ends_at: n.resolved_at.clone(),
		generator_url: n.generator_url.clone(),
	}]
}

#[derive(Debug, Deserialize)]
struct AmStatus {
	config: AmStatusConfig,
}

#[derive(Debug, Deserialize)]
struct AmStatusConfig {
	original: String,
}

#[derive(Debug, Deserialize)]
struct RoutingConfig {
	#[serde(default)]
	receivers: Vec<ReceiverDef>,
}

#[derive(Debug, Deserialize)]
struct ReceiverDef {
	name: String,
}

pub(crate) fn parse_receivers(routing_yaml: &str) -> Result<Vec<String>> {
	let cfg: RoutingConfig =
		serde_yaml::from_str(routing_yaml).context("parsing alertmanager routing config")?;
	Ok(cfg.receivers.into_iter().map(|r| r.name).collect())
}

impl AlertmanagerSender {
	pub fn new(
		url: &str,
		request_timeout: Duration,
		insecure_skip_verify: bool,
	) -> Result<Self> {
		let base = normalize_base_url(url)?;
		let client = reqwest::Client::builder()
			.timeout(request_timeout)
			.danger_accept_invalid_certs(insecure_skip_verify)
			.build()?;
		Ok(Self { base, client })
	}

	pub async fn health(&self) -> Result<()> {
		let resp = self
			.client
			.get(format!("{}/api/v2/status", self.base))
			.send()
			.await?;
		if resp.status().is_success() {
			Ok(())
		} else {
			Err(anyhow!("alertmanager status returned {}", resp.status()))
		}
	}

	/// Receiver names from the running routing configuration, to suggest
	/// label examples in admin surfaces.
	pub async fn receivers(&self) -> Result<Vec<String>> {
		let status: AmStatus = self
			.client
			.get(format!("{}/api/v2/status", self.base))
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		parse_receivers(&status.config.original)
	}
}

#[async_trait]
impl Sender for AlertmanagerSender {
	fn name(&self) -> &'static str {
		"alertmanager"
	}

	async fn send(&self, notification: &AlertNotification) -> Result<()> {
		let payload = to_payload(notification);
		let resp = self
			.client
			.post(format!("{}/api/v2/alerts", self.base))
			.json(&payload)
			.send()
			.await?;
		let status = resp.status();
		if status.is_success() {
			debug!(alert_id = notification.alert_id, "alertmanager accepted alert");
			Ok(())
		} else {
			let body = resp.text().await.unwrap_or_default();
			Err(anyhow!("alertmanager returned {status}: {body}"))
		}
	}
}

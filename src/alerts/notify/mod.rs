use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub mod alertmanager;
pub mod email;
pub mod webhook;

pub use alertmanager::AlertmanagerSender;
pub use email::EmailSender;
pub use webhook::WebhookSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyStatus {
	Firing,
	Resolved,
}

/// Built from an alert and its evaluation outcome at dispatch time; never
/// persisted (only the history entry is).
#[derive(Debug, Clone, Serialize)]
pub struct AlertNotification {
	pub alert_id: i64,
	pub alert_name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub status: NotifyStatus,
	pub severity: String,
	pub team_id: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub team_name: Option<String>,
	pub source_id: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub source_name: Option<String>,
	pub value: f64,
	pub threshold_operator: String,
	pub threshold_value: f64,
	pub frequency_seconds: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub lookback_seconds: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub query: Option<String>,
	pub triggered_at: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub resolved_at: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub generator_url: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	/// Email routing only, not part of any wire payload.
	#[serde(skip)]
	pub recipients: Vec<String>,
}

impl AlertNotification {
	pub fn status_word(&self) -> &'static str {
		match self.status {
			NotifyStatus::Firing => "FIRING",
			NotifyStatus::Resolved => "RESOLVED",
		}
	}
}

#[async_trait]
pub trait Sender: Send + Sync {
	fn name(&self) -> &'static str;
	async fn send(&self, notification: &AlertNotification) -> Result<()>;
}

/// Fans a notification out to every configured channel concurrently and
/// concatenates the failures. A partial failure never rolls back the
/// alert state transition that produced the dispatch.
pub struct MultiSender {
	senders: Vec<Arc<dyn Sender>>,
	dispatch_timeout: Duration,
}

impl MultiSender {
	pub fn new(senders: Vec<Arc<dyn Sender>>, dispatch_timeout: Duration) -> Self {
		Self {
			senders,
			dispatch_timeout,
		}
	}

	pub fn empty() -> Self {
		Self::new(vec![], Duration::from_secs(5))
	}

	pub fn is_empty(&self) -> bool {
		self.senders.is_empty()
	}

	pub async fn dispatch(&self, notification: &AlertNotification) -> Result<()> {
		if self.senders.is_empty() {
			debug!(
				alert_id = notification.alert_id,
				"no notification channels configured"
			);
			return Ok(());
		}
		let mut set = JoinSet::new();
		for sender in &self.senders {
			let sender = sender.clone();
			let notification = notification.clone();
			let timeout = self.dispatch_timeout;
			set.spawn(async move {
				let name = sender.name();
				let outcome =
					match tokio::time::timeout(timeout, sender.send(&notification)).await {
						Ok(result) => result,
						Err(_) => Err(anyhow!("dispatch timed out after {timeout:?}")),
					};
				(name, outcome)
			});
		}
		let mut failures = vec![];
		while let Some(joined) = set.join_next().await {
			match joined {
				Ok((_, Ok(()))) => {}
				Ok((name, Err(e))) => {
					warn!(
						alert_id = notification.alert_id,
						channel = name,
						error = %e,
						"notification dispatch failed"
					);
					failures.push(format!("{name}: {e}"));
				}
				Err(e) => failures.push(format!("join: {e}")),
			}
		}
		if failures.is_empty() {
			Ok(())
		} else {
			Err(anyhow!(failures.join("; ")))
		}
	}
}

#[cfg(test)]
pub(crate) fn sample_notification(status: NotifyStatus) -> AlertNotification {
	AlertNotification {
		alert_id: 42,
		alert_name: "high error rate".to_string(),
		description: Some("too many 5xx".to_string()),
		status,
		severity: "critical".to_string(),
		team_id: 1,
		team_name: Some("platform".to_string()),
		source_id: 3,
		source_name: Some("app-logs".to_string()),
		value: 15.0,
		threshold_operator: ">".to_string(),
		threshold_value: 10.0,
		frequency_seconds: 60,
		lookback_seconds: Some(300),
		query: Some(r#"level="error""#.to_string()),
		triggered_at: "2024-01-15T10:00:00.000Z".to_string(),
		resolved_at: None,
		generator_url: None,
		message: Some("alert high error rate triggered with value 15.0000".to_string()),
		recipients: vec!["oncall@example.com".to_string()],
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct CountingSender {
		calls: Arc<AtomicUsize>,
		fail: bool,
	}

	#[async_trait]
	impl Sender for CountingSender {
		fn name(&self) -> &'static str {
			"counting"
		}
		async fn send(&self, _n: &AlertNotification) -> Result<()> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			if self.fail {
				Err(anyhow!("boom"))
			} else {
				Ok(())
			}
		}
	}

	#[tokio::test]
	async fn test_dispatch_fans_out_and_aggregates_failures() {
		let ok_calls = Arc::new(AtomicUsize::new(0));
		let bad_calls = Arc::new(AtomicUsize::new(0));
		let multi = MultiSender::new(
			vec![
				Arc::new(CountingSender {
					calls: ok_calls.clone(),
					fail: false,
				}),
				Arc::new(CountingSender {
					calls: bad_calls.clone(),
					fail: true,
				}),
			],
			Duration::from_secs(1),
		);
		let err = multi
			.dispatch(&sample_notification(NotifyStatus::Firing))
			.await
			.unwrap_err();
		assert_eq!(1, ok_calls.load(Ordering::SeqCst));
		assert_eq!(1, bad_calls.load(Ordering::SeqCst));
		assert!(err.to_string().contains("boom"));
	}

	#[tokio::test]
	async fn test_empty_multi_sender_is_noop() {
		let multi = MultiSender::empty();
		multi
			.dispatch(&sample_notification(NotifyStatus::Resolved))
			.await
			.unwrap();
	}

	#[test]
	fn test_payload_shape() {
		let payload =
			serde_json::to_value(sample_notification(NotifyStatus::Firing)).unwrap();
		assert_eq!("firing", payload["status"]);
		assert_eq!(42, payload["alert_id"]);
		assert_eq!(">", payload["threshold_operator"]);
		assert_eq!(10.0, payload["threshold_value"]);
		// routing-only field stays out of the wire payload
		assert!(payload.get("recipients").is_none());
		assert!(payload.get("resolved_at").is_none());
	}
}

use crate::alerts::notify::{AlertNotification, MultiSender, NotifyStatus};
use crate::backends::BackendRegistry;
use crate::config::AlertsConfig;
use crate::meta::{
	Alert, AlertQueryKind, AlertState, ConnectionInfo, MetaStore, NewAlertHistory, Source,
};
use crate::services::scalar::extract_scalar;
use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use common::{format_rfc3339_millis, format_sql_datetime, TimeRange};
use sqlbuilder::clickhouse::{lower_expr as lower_sql, quote_ident};
use sqlbuilder::logsql::{full_query as logsql_full_query, lower_expr as lower_logsql};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// The scheduled loop that re-runs stored alert queries. One task per due
/// alert within a tick; the tick joins them all before the next fires, so
/// a single alert never evaluates concurrently with itself.
pub struct AlertEvaluator {
	meta: Arc<dyn MetaStore>,
	registry: Arc<BackendRegistry>,
	notifier: Arc<MultiSender>,
	cfg: AlertsConfig,
}

/// A DSL alert counts matching rows; the threshold compares against that
/// count. Native alerts run verbatim and their first cell is coerced.
fn build_alert_query(alert: &Alert, source: &Source, range: &TimeRange) -> Result<String> {
	match alert.query_kind {
		AlertQueryKind::Native => Ok(alert.query.clone()),
		AlertQueryKind::Dsl => {
			let ast = logchefql::parse(&alert.query)
				.map_err(|e| anyhow!("alert query does not parse: {e}"))?;
			match &source.connection {
				ConnectionInfo::Sql(conn) => {
					let mut where_part = format!(
						"{} BETWEEN toDateTime('{}','{}') AND toDateTime('{}','{}')",
						quote_ident(&source.ts_field),
						format_sql_datetime(range.start),
						range.timezone,
						format_sql_datetime(range.end),
						range.timezone,
					);
					if let Some(expr) = &ast.expr {
						let fragment = lower_sql(expr)?;
						where_part.push_str(" AND ");
						if fragment.starts_with('(') {
							where_part.push_str(&fragment);
						} else {
							where_part.push_str(&format!("({fragment})"));
						}
					}
					Ok(format!(
						"SELECT count(*) AS matches FROM {}.{} WHERE {}",
						conn.database, conn.table, where_part
					))
				}
				ConnectionInfo::Logsql(_) => {
					let expr = match &ast.expr {
						Some(expr) => Some(lower_logsql(expr)?),
						None => None,
					};
					Ok(format!(
						"{} | stats count(*) as matches",
						logsql_full_query(expr.as_deref(), range)
					))
				}
			}
		}
	}
}

impl AlertEvaluator {
	pub fn new(
		meta: Arc<dyn MetaStore>,
		registry: Arc<BackendRegistry>,
		notifier: Arc<MultiSender>,
		cfg: AlertsConfig,
	) -> Self {
		Self {
			meta,
			registry,
			notifier,
			cfg,
		}
	}

	pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
		tokio::spawn(async move {
			info!(
				interval = ?self.cfg.evaluation_interval,
				"alert evaluator started"
			);
			let mut ticker = tokio::time::interval(self.cfg.evaluation_interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = ticker.tick() => {}
					_ = shutdown.changed() => break,
				}
				self.run_tick().await;
			}
			info!("alert evaluator stopped");
		})
	}

	pub async fn run_tick(self: &Arc<Self>) {
		let now = chrono::Utc::now().naive_utc();
		let due = match self.meta.list_due_alerts(now).await {
			Ok(due) => due,
			Err(e) => {
				error!(error = %e, "listing due alerts failed");
				return;
			}
		};
		if due.is_empty() {
			return;
		}
		debug!(count = due.len(), "evaluating due alerts");
		let mut set = JoinSet::new();
		for alert in due {
			let evaluator = Arc::clone(self);
			set.spawn(async move {
				evaluator.evaluate_one(alert).await;
			});
		}
		while set.join_next().await.is_some() {}
	}

	async fn evaluate_one(&self, alert: Alert) {
		let now = chrono::Utc::now().naive_utc();
		match self.evaluate_value(&alert, now).await {
			Ok(value) => {
				if let Err(e) = self.apply_transition(&alert, value, now).await {
					error!(alert_id = alert.id, error = %e, "alert state transition failed");
				}
			}
			// execution failures do not move the state machine
			Err(e) => warn!(
				alert_id = alert.id,
				error = %e,
				"alert evaluation failed, treated as idle for this tick"
			),
		}
		let next_due = now + chrono::Duration::seconds(alert.frequency_secs as i64);
		if let Err(e) = self.meta.mark_alert_evaluated(alert.id, now, next_due).await {
			error!(alert_id = alert.id, error = %e, "marking alert evaluated failed");
		}
	}

	async fn evaluate_value(&self, alert: &Alert, now: NaiveDateTime) -> Result<f64> {
		let source = self.meta.get_source(alert.source_id).await?;
		let client = self.registry.get_client(source.id)?;
		let lookback = alert
			.lookback_secs
			.map(Duration::from_secs)
			.unwrap_or(self.cfg.default_lookback);
		let range = TimeRange {
			start: now - chrono::Duration::from_std(lookback)?,
			end: now,
			timezone: "UTC".to_string(),
		};
		let query = build_alert_query(alert, &source, &range)?;
		let output = client.query(&query, None).await?;
		Ok(extract_scalar(&output)?)
	}

	pub(crate) async fn apply_transition(
		&self,
		alert: &Alert,
		value: f64,
		now: NaiveDateTime,
	) -> Result<()> {
		let breached = alert.threshold_op.compare(value, alert.threshold_value);
		match (alert.state, breached) {
			(AlertState::Idle, true) => {
				let message = format!(
					"alert {} triggered with value {:.4} (threshold {} {})",
					alert.name,
					value,
					alert.threshold_op.as_str(),
					alert.threshold_value,
				);
				self.meta
					.insert_history(NewAlertHistory {
						alert_id: alert.id,
						triggered_at: now,
						value_text: format!("{value:.4}"),
						recipients: alert.recipients.clone(),
						message: message.clone(),
					})
					.await?;
				self.meta
					.prune_history(alert.id, self.cfg.history_limit)
					.await?;
				self.meta.mark_alert_triggered(alert.id, now).await?;
				info!(alert_id = alert.id, value, "alert firing");
				let notification = self
					.build_notification(alert, value, now, None, NotifyStatus::Firing, message)
					.await;
				if let Err(e) = self.notifier.dispatch(&notification).await {
					warn!(alert_id = alert.id, error = %e, "firing notification failed");
				}
			}
			(AlertState::Firing, true) => {
				// still breaching, duplicate notifications suppressed
				debug!(alert_id = alert.id, value, "alert still firing");
			}
			(AlertState::Firing, false) => {
				let message =
					format!("alert {} resolved with value {:.4}", alert.name, value);
				if let Some(open) = self.meta.latest_unresolved_history(alert.id).await? {
					self.meta.resolve_history(open.id, &message, now).await?;
				}
				self.meta.set_alert_state(alert.id, AlertState::Idle).await?;
				info!(alert_id = alert.id, value, "alert resolved");
				let notification = self
					.build_notification(
						alert,
						value,
						alert.last_triggered_at.unwrap_or(now),
						Some(now),
						NotifyStatus::Resolved,
						message,
					)
					.await;
				if let Err(e) = self.notifier.dispatch(&notification).await {
					warn!(alert_id = alert.id, error = %e, "resolution notification failed");
				}
			}
			(AlertState::Idle, false) => {}
		}
		Ok(())
	}

	async fn build_notification(
		&self,
		alert: &Alert,
		value: f64,
		triggered_at: NaiveDateTime,
		resolved_at: Option<NaiveDateTime>,
		status: NotifyStatus,
		message: String,
	) -> AlertNotification {
		let team_name = self.meta.get_team_name(alert.team_id).await.ok().flatten();
		let source_name = self
			.meta
			.get_source(alert.source_id)
			.await
			.ok()
			.map(|s| s.name);
		AlertNotification {
			alert_id: alert.id,
			alert_name: alert.name.clone(),
			description: alert.description.clone(),
			status,
			severity: alert.severity.clone(),
			team_id: alert.team_id,
			team_name,
			source_id: alert.source_id,
			source_name,
			value,
			threshold_operator: alert.threshold_op.as_str().to_string(),
			threshold_value: alert.threshold_value,
			frequency_seconds: alert.frequency_secs,
			lookback_seconds: alert.lookback_secs,
			query: Some(alert.query.clone()),
			triggered_at: format_rfc3339_millis(triggered_at),
			resolved_at: resolved_at.map(format_rfc3339_millis),
			generator_url: None,
			message: Some(message),
			recipients: alert.recipients.clone(),
		}
	}
}

use super::{AlertNotification, Sender};
use crate::config::{SmtpConfig, SmtpSecurity};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

/// SMTP sender. A fresh connection is opened per dispatch; recipients are
/// addressed individually and their failures concatenated.
pub struct EmailSender {
	cfg: SmtpConfig,
	insecure_skip_verify: bool,
}

impl EmailSender {
	pub fn new(cfg: SmtpConfig, insecure_skip_verify: bool) -> Self {
		Self {
			cfg,
			insecure_skip_verify,
		}
	}

	fn tls_parameters(&self) -> Result<TlsParameters> {
		TlsParameters::builder(self.cfg.host.clone())
			.dangerous_accept_invalid_certs(self.insecure_skip_verify)
			.build()
			.context("building smtp tls parameters")
	}

	fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
		let mut builder = match self.cfg.security {
			SmtpSecurity::None => {
				AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.cfg.host)
			}
			SmtpSecurity::Starttls => {
				let mut b = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(
					&self.cfg.host,
				)
				.context("building starttls smtp transport")?;
				if self.insecure_skip_verify {
					b = b.tls(Tls::Required(self.tls_parameters()?));
				}
				b
			}
			SmtpSecurity::Tls => {
				let mut b = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.cfg.host)
					.context("building tls smtp transport")?;
				if self.insecure_skip_verify {
					b = b.tls(Tls::Wrapper(self.tls_parameters()?));
				}
				b
			}
		};
		if self.cfg.port != 0 {
			builder = builder.port(self.cfg.port);
		}
		if let (Some(user), Some(pass)) = (&self.cfg.username, &self.cfg.password) {
			builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
		}
		Ok(builder.build())
	}
}

pub(crate) fn format_subject(n: &AlertNotification) -> String {
	format!("[logchef] {} - {}", n.alert_name, n.status_word())
}

pub(crate) fn format_body(n: &AlertNotification) -> String {
	let mut lines = vec![
		format!("Alert: {}", n.alert_name),
		format!("Status: {}", n.status_word()),
		format!("Severity: {}", n.severity),
	];
	if let Some(team) = &n.team_name {
		lines.push(format!("Team: {team}"));
	}
	if let Some(source) = &n.source_name {
		lines.push(format!("Source: {source}"));
	}
	lines.push(format!(
		"Value: {} (threshold {} {})",
		n.value, n.threshold_operator, n.threshold_value
	));
	if let Some(query) = &n.query {
		lines.push(format!("Query: {query}"));
	}
	lines.push(format!("Triggered at: {}", n.triggered_at));
	if let Some(resolved_at) = &n.resolved_at {
		lines.push(format!("Resolved at: {resolved_at}"));
	}
	if let Some(message) = &n.message {
		lines.push(String::new());
		lines.push(message.clone());
	}
	lines.join("\n")
}

#[async_trait]
impl Sender for EmailSender {
	fn name(&self) -> &'static str {
		"email"
	}

	async fn send(&self, notification: &AlertNotification) -> Result<()> {
		if notification.recipients.is_empty() {
			debug!(alert_id = notification.alert_id, "no email recipients");
			return Ok(());
		}
		let transport = self.build_transport()?;
		let from: Mailbox = self
			.cfg
			.from_address
			.parse()
			.map_err(|e| anyhow!("bad from address {}: {e}", self.cfg.from_address))?;
		let subject = format_subject(notification);
		let body = format_body(notification);

		let mut failures = vec![];
		for recipient in &notification.recipients {
			let to: Mailbox = match recipient.parse() {
				Ok(mbox) => mbox,
				Err(e) => {
					failures.push(format!("{recipient}: bad address: {e}"));
					continue;
				}
			};
			let mut message = Message::builder()
				.from(from.clone())
				.to(to)
				.subject(subject.clone())
				.header(ContentType::TEXT_PLAIN);
			if let Some(reply_to) = &self.cfg.reply_to {
				if let Ok(mbox) = reply_to.parse::<Mailbox>() {
					message = message.reply_to(mbox);
				}
			}
			let email = match message.body(body.clone()) {
				Ok(email) => email,
				Err(e) => {
					failures.push(format!("{recipient}: build failed: {e}"));
					continue;
				}
			};
			if let Err(e) = transport.send(email).await {
				failures.push(format!("{recipient}: {e}"));
			}
		}
		if failures.is_empty() {
			Ok(())
		} else {
			Err(anyhow!(failures.join("; ")))
		}
	}
}

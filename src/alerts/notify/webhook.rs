use super::{AlertNotification, Sender};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const LOGGED_BODY_CAP: usize = 512;

/// JSON POST with bounded retries: network errors and 5xx back off
/// exponentially, 4xx is terminal.
pub struct WebhookSender {
	url: String,
	client: reqwest::Client,
	max_retries: u32,
	initial_backoff: Duration,
}

impl WebhookSender {
	pub fn new(url: String, request_timeout: Duration, insecure_skip_verify: bool) -> Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(request_timeout)
			.danger_accept_invalid_certs(insecure_skip_verify)
			.build()?;
		Ok(Self {
			url,
			client,
			max_retries: DEFAULT_MAX_RETRIES,
			initial_backoff: DEFAULT_INITIAL_BACKOFF,
		})
	}

	#[cfg(test)]
	pub(crate) fn with_backoff(mut self, initial: Duration) -> Self {
		self.initial_backoff = initial;
		self
	}
}

fn cap_body(body: &str) -> &str {
	if body.len() <= LOGGED_BODY_CAP {
		return body;
	}
	let mut end = LOGGED_BODY_CAP;
	while !body.is_char_boundary(end) {
		end -= 1;
	}
	&body[..end]
}

#[async_trait]
impl Sender for WebhookSender {
	fn name(&self) -> &'static str {
		"webhook"
	}

	async fn send(&self, notification: &AlertNotification) -> Result<()> {
		let mut delay = self.initial_backoff;
		let mut attempt = 0u32;
		loop {
			let outcome = self
				.client
				.post(&self.url)
				.json(notification)
				.send()
				.await;
			let retryable = match outcome {
				Ok(resp) if resp.status().is_success() => {
					debug!(url = %self.url, attempt, "webhook delivered");
					return Ok(());
				}
				Ok(resp) => {
					let status = resp.status();
					let body = resp.text().await.unwrap_or_default();
					let detail =
						format!("webhook returned {}: {}", status, cap_body(&body));
					if status.is_client_error() {
						return Err(anyhow!(detail));
					}
					detail
				}
				Err(e) => format!("webhook request failed: {e}"),
			};
			if attempt >= self.max_retries {
				return Err(anyhow!("{retryable} (after {attempt} retries)"));
			}
			attempt += 1;
			tokio::time::sleep(delay).await;
			delay *= 2;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::super::{sample_notification, NotifyStatus};
	use super::*;
	use axum::extract::State;
	use axum::http::StatusCode;
	use axum::routing::post;
	use axum::{Json, Router};
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;
	use std::time::Instant;

	#[derive(Clone, Default)]
	struct Hits {
		attempts: Arc<AtomicUsize>,
		delivered: Arc<AtomicUsize>,
		fail_first: usize,
	}

	async fn hook(
		State(hits): State<Hits>,
		Json(body): Json<serde_json::Value>,
	) -> StatusCode {
		let n = hits.attempts.fetch_add(1, Ordering::SeqCst);
		if n < hits.fail_first {
			return StatusCode::SERVICE_UNAVAILABLE;
		}
		assert_eq!("high error rate", body["alert_name"]);
		hits.delivered.fetch_add(1, Ordering::SeqCst);
		StatusCode::OK
	}

	async fn serve(hits: Hits) -> String {
		let app = Router::new().route("/hook", post(hook)).with_state(hits);
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			axum::serve(listener, app).await.unwrap();
		});
		format!("http://{addr}/hook")
	}

	#[tokio::test]
	async fn test_retries_until_success_with_backoff() {
		let hits = Hits {
			fail_first: 2,
			..Hits::default()
		};
		let url = serve(hits.clone()).await;
		let sender = WebhookSender::new(url, Duration::from_secs(5), false).unwrap();

		let started = Instant::now();
		sender
			.send(&sample_notification(NotifyStatus::Firing))
			.await
			.unwrap();
		// 500ms then 1s of backoff before the third attempt lands
		assert!(started.elapsed() >= Duration::from_millis(1500));
		assert_eq!(3, hits.attempts.load(Ordering::SeqCst));
		assert_eq!(1, hits.delivered.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn test_client_error_is_terminal() {
		let hits = Hits {
			fail_first: 0,
			..Hits::default()
		};
		let attempts = hits.attempts.clone();
		let app = Router::new().route(
			"/hook",
			post(move || {
				let attempts = attempts.clone();
				async move {
					attempts.fetch_add(1, Ordering::SeqCst);
					StatusCode::BAD_REQUEST
				}
			}),
		);
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			axum::serve(listener, app).await.unwrap();
		});

		let sender = WebhookSender::new(
			format!("http://{addr}/hook"),
			Duration::from_secs(5),
			false,
		)
		.unwrap()
		.with_backoff(Duration::from_millis(10));
		let err = sender
			.send(&sample_notification(NotifyStatus::Firing))
			.await
			.unwrap_err();
		assert!(err.to_string().contains("400"));
		assert_eq!(1, hits.attempts.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn test_gives_up_after_bounded_retries() {
		let hits = Hits {
			fail_first: usize::MAX,
			..Hits::default()
		};
		let url = serve(hits.clone()).await;
		let sender = WebhookSender::new(url, Duration::from_secs(5), false)
			.unwrap()
			.with_backoff(Duration::from_millis(10));
		let err = sender
			.send(&sample_notification(NotifyStatus::Firing))
			.await
			.unwrap_err();
		assert!(err.to_string().contains("after 2 retries"));
		assert_eq!(3, hits.attempts.load(Ordering::SeqCst));
	}
}

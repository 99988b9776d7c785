use crate::{explore, metrics, state};
use axum::{
	extract::Request,
	http::StatusCode,
	middleware::from_fn_with_state,
	routing::{any, get, post},
	Router,
};
use http::Request as HttpRequest;
use tower::ServiceBuilder;
use tower_http::trace::DefaultOnResponse;
use tower_http::{
	compression::CompressionLayer, decompression::RequestDecompressionLayer,
	timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{info, Span};

static SKIP_LOGGING_PATHS: [&str; 2] = ["/ready", "/metrics"];

pub fn new_router(state: state::AppState) -> Router {
	let cfg = state.config.clone();
	Router::new()
		.route("/ready", any(ok))
		.route("/metrics", get(metrics::export_metrics))
		.route(
			"/api/v1/teams/{team_id}/sources/{source_id}/logs/query",
			post(explore::query_logs),
		)
		.route(
			"/api/v1/teams/{team_id}/sources/{source_id}/logs/translate",
			post(explore::translate_query),
		)
		.route(
			"/api/v1/teams/{team_id}/sources/{source_id}/logs/histogram",
			post(explore::query_histogram),
		)
		.route(
			"/api/v1/teams/{team_id}/sources/{source_id}/logs/context",
			post(explore::query_context),
		)
		.route(
			"/api/v1/teams/{team_id}/sources/{source_id}/logs/field_values",
			post(explore::field_values),
		)
		.route(
			"/api/v1/teams/{team_id}/sources/{source_id}/schema",
			get(explore::source_schema),
		)
		.route(
			"/api/v1/teams/{team_id}/sources/{source_id}/health",
			get(explore::source_health),
		)
		.fallback(handler_404)
		.with_state(state.clone())
		.layer(
			ServiceBuilder::new()
				.layer(
					TraceLayer::new_for_http()
						.on_request(|req: &HttpRequest<_>, _: &Span| {
							let p = req.uri().path();
							if SKIP_LOGGING_PATHS.contains(&p) {
								return;
							}
							info!(method = ?req.method(), path = p, "request received");
						})
						.on_response(
							DefaultOnResponse::new().level(tracing::Level::INFO),
						),
				)
				.layer(from_fn_with_state(state, metrics::record_middleware))
				.layer(TimeoutLayer::new(cfg.server.http_server_timeout))
				.layer(CompressionLayer::new())
				.layer(RequestDecompressionLayer::new()),
		)
}

async fn ok() -> StatusCode {
	StatusCode::OK
}

async fn handler_404(_req: Request) -> StatusCode {
	StatusCode::NOT_FOUND
}

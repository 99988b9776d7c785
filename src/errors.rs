use crate::backends::BackendError;
use crate::meta::MetaError;
use axum::{
	http::StatusCode,
	response::{IntoResponse, Json, Response},
};
use common::TimeRangeError;
use logchefql::ParseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
	#[error("invalid query: {0}")]
	Parse(#[from] ParseError),
	#[error(transparent)]
	TimeRange(#[from] TimeRangeError),
	#[error(transparent)]
	Backend(#[from] BackendError),
	#[error(transparent)]
	Meta(#[from] MetaError),
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("not found: {0}")]
	NotFound(String),
	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

impl AppError {
	pub fn error_type(&self) -> &'static str {
		match self {
			AppError::Parse(_) => "ParseError",
			AppError::TimeRange(_) => "TimeRangeInvalid",
			AppError::Backend(BackendError::Timeout(_)) => "BackendTimeout",
			AppError::Backend(BackendError::Unavailable(_)) => "BackendUnavailable",
			AppError::Backend(BackendError::InvalidQuery(_)) => "InvalidQuery",
			AppError::Backend(BackendError::PermissionDenied(_)) => "PermissionDenied",
			AppError::Backend(BackendError::NotFound(_)) => "NotFound",
			AppError::Backend(BackendError::Internal(_)) => "Internal",
			AppError::Meta(MetaError::NotFound(_)) => "NotFound",
			AppError::Meta(MetaError::Internal(_)) => "Internal",
			AppError::InvalidRequest(_) => "InvalidQuery",
			AppError::NotFound(_) => "NotFound",
			AppError::Internal(_) => "Internal",
		}
	}

	fn status_code(&self) -> StatusCode {
		match self.error_type() {
			"ParseError" | "TimeRangeInvalid" | "InvalidQuery" => StatusCode::BAD_REQUEST,
			"BackendTimeout" => StatusCode::GATEWAY_TIMEOUT,
			"BackendUnavailable" => StatusCode::SERVICE_UNAVAILABLE,
			"NotFound" => StatusCode::NOT_FOUND,
			"PermissionDenied" => StatusCode::FORBIDDEN,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for AppError {
	fn into_response(self) -> Response {
		let body = serde_json::json!({
			"status": "error",
			"message": self.to_string(),
			"error_type": self.error_type(),
		});
		(self.status_code(), Json(body)).into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use std::time::Duration;

	#[test]
	fn test_error_type_mapping() {
		let test_cases: Vec<(AppError, &str, StatusCode)> = vec![
			(
				AppError::Parse(logchefql::parse("a=").unwrap_err()),
				"ParseError",
				StatusCode::BAD_REQUEST,
			),
			(
				AppError::Backend(BackendError::Timeout(Duration::from_secs(60))),
				"BackendTimeout",
				StatusCode::GATEWAY_TIMEOUT,
			),
			(
				AppError::Backend(BackendError::Unavailable("down".to_string())),
				"BackendUnavailable",
				StatusCode::SERVICE_UNAVAILABLE,
			),
			(
				AppError::Backend(BackendError::NotFound("source 9".to_string())),
				"NotFound",
				StatusCode::NOT_FOUND,
			),
			(
				AppError::Backend(BackendError::PermissionDenied("no".to_string())),
				"PermissionDenied",
				StatusCode::FORBIDDEN,
			),
			(
				AppError::Meta(MetaError::NotFound("alert 4".to_string())),
				"NotFound",
				StatusCode::NOT_FOUND,
			),
			(
				AppError::InvalidRequest("limit too large".to_string()),
				"InvalidQuery",
				StatusCode::BAD_REQUEST,
			),
		];
		for (err, expect_type, expect_status) in test_cases {
			assert_eq!(expect_type, err.error_type());
			assert_eq!(expect_status, err.status_code());
		}
	}

	#[tokio::test]
	async fn test_envelope_shape() {
		let err = AppError::Backend(BackendError::Timeout(Duration::from_secs(60)));
		let resp = err.into_response();
		assert_eq!(StatusCode::GATEWAY_TIMEOUT, resp.status());
		let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
			.await
			.unwrap();
		let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!("error", body["status"]);
		assert_eq!("BackendTimeout", body["error_type"]);
		assert!(body["message"].as_str().unwrap().contains("timed out"));
	}
}

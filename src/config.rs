use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::{env, net::SocketAddr, str::FromStr, time::Duration};
use tracing_subscriber::filter::Builder;
use validator::{Validate, ValidationError};

/// Environment override prefix: `SERVICE_<SECTION>__<KEY>`.
const ENV_PREFIX: &str = "SERVICE";

#[derive(Clone, Deserialize, Validate)]
pub struct AppConfig {
	#[validate(nested)]
	pub server: Server,
	#[serde(default)]
	pub metastore: Metastore,
	#[serde(default)]
	#[validate(nested)]
	pub query: QueryConfig,
	#[serde(default)]
	pub backends: BackendsConfig,
	#[serde(default)]
	pub alerts: AlertsConfig,
	#[serde(default)]
	pub alertmanager: Option<AlertmanagerConfig>,
}

#[derive(Clone, Deserialize, Validate)]
pub struct Server {
	#[validate(custom(function = "validate_ip_addr"))]
	pub listen_addr: String,
	#[serde(with = "humantime_serde", default = "default_http_server_timeout")]
	pub http_server_timeout: Duration,
	#[serde(default)]
	#[validate(nested)]
	pub log: Log,
}

const fn default_http_server_timeout() -> Duration {
	Duration::from_secs(30)
}

fn validate_ip_addr(addr: &str) -> Result<(), ValidationError> {
	SocketAddr::from_str(addr)
		.map_err(|_| ValidationError::new("invalid bind address"))
		.map(|_| ())
}

#[derive(Clone, Deserialize, Validate)]
pub struct Log {
	pub file: String,
	// see https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives
	#[validate(custom(function = "validate_log_filter_directives"))]
	pub filter_directives: String,
}

impl Default for Log {
	fn default() -> Self {
		Self {
			file: "stdout".to_string(),
			filter_directives: "info".to_string(),
		}
	}
}

fn validate_log_filter_directives(dirs: &str) -> Result<(), ValidationError> {
	Builder::default()
		.parse(dirs)
		.map_err(|_| ValidationError::new("invalid log filter directives"))
		.map(|_| ())
}

#[derive(Clone, Deserialize)]
pub struct Metastore {
	#[serde(default = "default_metastore_path")]
	pub path: String,
}

impl Default for Metastore {
	fn default() -> Self {
		Self {
			path: default_metastore_path(),
		}
	}
}

fn default_metastore_path() -> String {
	"logchef.db".to_string()
}

#[derive(Clone, Deserialize, Validate)]
pub struct QueryConfig {
	#[serde(default = "default_max_limit")]
	pub max_limit: u32,
	#[serde(with = "humantime_serde", default = "default_query_timeout")]
	pub default_timeout: Duration,
	#[serde(default = "default_translate_cache")]
	#[validate(nested)]
	pub cache: TranslateCache,
}

impl Default for QueryConfig {
	fn default() -> Self {
		Self {
			max_limit: default_max_limit(),
			default_timeout: default_query_timeout(),
			cache: default_translate_cache(),
		}
	}
}

const fn default_max_limit() -> u32 {
	1000
}

const fn default_query_timeout() -> Duration {
	Duration::from_secs(60)
}

#[derive(Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_cache_config"))]
pub struct TranslateCache {
	#[serde(default = "default_cache_max_capacity")]
	pub max_capacity: u64,
	#[serde(with = "humantime_serde", default = "default_cache_ttl")]
	pub time_to_live: Duration,
	#[serde(with = "humantime_serde", default = "default_cache_ttl")]
	pub time_to_idle: Duration,
}

fn validate_cache_config(cfg: &TranslateCache) -> Result<(), ValidationError> {
	if cfg.time_to_idle > cfg.time_to_live {
		return Err(ValidationError::new(
			"time_to_idle must be no greater than time_to_live",
		));
	}
	Ok(())
}

const fn default_translate_cache() -> TranslateCache {
	TranslateCache {
		max_capacity: default_cache_max_capacity(),
		time_to_live: default_cache_ttl(),
		time_to_idle: default_cache_ttl(),
	}
}

const fn default_cache_max_capacity() -> u64 {
	// 64MB of encoded translations
	64 * 1024 * 1024
}

const fn default_cache_ttl() -> Duration {
	Duration::from_secs(30)
}

#[derive(Clone, Deserialize)]
pub struct BackendsConfig {
	#[serde(with = "humantime_serde", default = "default_health_check_interval")]
	pub health_check_interval: Duration,
	#[serde(with = "humantime_serde", default = "default_probe_timeout")]
	pub probe_timeout: Duration,
}

impl Default for BackendsConfig {
	fn default() -> Self {
		Self {
			health_check_interval: default_health_check_interval(),
			probe_timeout: default_probe_timeout(),
		}
	}
}

const fn default_health_check_interval() -> Duration {
	Duration::from_secs(60)
}

const fn default_probe_timeout() -> Duration {
	Duration::from_secs(5)
}

#[derive(Clone, Deserialize)]
pub struct AlertsConfig {
	#[serde(default = "default_alerts_enabled")]
	pub enabled: bool,
	#[serde(with = "humantime_serde", default = "default_evaluation_interval")]
	pub evaluation_interval: Duration,
	#[serde(with = "humantime_serde", default = "default_lookback")]
	pub default_lookback: Duration,
	#[serde(default = "default_history_limit")]
	pub history_limit: u32,
	#[serde(with = "humantime_serde", default = "default_request_timeout")]
	pub request_timeout: Duration,
	#[serde(default)]
	pub tls_insecure_skip_verify: bool,
	#[serde(default)]
	pub smtp: Option<SmtpConfig>,
	#[serde(default)]
	pub webhook_url: Option<String>,
}

impl Default for AlertsConfig {
	fn default() -> Self {
		Self {
			enabled: default_alerts_enabled(),
			evaluation_interval: default_evaluation_interval(),
			default_lookback: default_lookback(),
			history_limit: default_history_limit(),
			request_timeout: default_request_timeout(),
			tls_insecure_skip_verify: false,
			smtp: None,
			webhook_url: None,
		}
	}
}

const fn default_alerts_enabled() -> bool {
	true
}

const fn default_evaluation_interval() -> Duration {
	Duration::from_secs(60)
}

const fn default_lookback() -> Duration {
	Duration::from_secs(5 * 60)
}

const fn default_history_limit() -> u32 {
	100
}

const fn default_request_timeout() -> Duration {
	Duration::from_secs(5)
}

#[derive(Clone, Copy, Deserialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
	None,
	Starttls,
	Tls,
}

#[derive(Clone, Deserialize, PartialEq, Eq, Debug)]
pub struct SmtpConfig {
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
	pub from_address: String,
	#[serde(default)]
	pub reply_to: Option<String>,
	#[serde(default = "default_smtp_security")]
	pub security: SmtpSecurity,
}

const fn default_smtp_security() -> SmtpSecurity {
	SmtpSecurity::Starttls
}

#[derive(Clone, Deserialize, PartialEq, Eq, Debug)]
pub struct AlertmanagerConfig {
	/// Base URL, with or without the `/api/v2/alerts` suffix.
	pub url: String,
}

impl AppConfig {
	pub fn new() -> Result<Self, ConfigError> {
		let default_config =
			env::var("LOGCHEF_CONFIG").unwrap_or("config.yaml".to_string());
		Config::builder()
			.add_source(File::with_name(&default_config))
			.add_source(
				Environment::with_prefix(ENV_PREFIX)
					.prefix_separator("_")
					.separator("__"),
			)
			.build()?
			.try_deserialize()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn from_yaml(yaml: &str) -> AppConfig {
		Config::builder()
			.add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap()
	}

	#[test]
	fn test_minimal_config_gets_defaults() {
		let cfg = from_yaml(
			r#"
server:
  listen_addr: "0.0.0.0:8125"
"#,
		);
		cfg.validate().unwrap();
		assert_eq!(Duration::from_secs(30), cfg.server.http_server_timeout);
		assert_eq!(1000, cfg.query.max_limit);
		assert_eq!(Duration::from_secs(60), cfg.query.default_timeout);
		assert_eq!(Duration::from_secs(30), cfg.query.cache.time_to_live);
		assert_eq!(Duration::from_secs(60), cfg.backends.health_check_interval);
		assert_eq!(Duration::from_secs(5), cfg.backends.probe_timeout);
		assert!(cfg.alerts.enabled);
		assert_eq!(Duration::from_secs(60), cfg.alerts.evaluation_interval);
		assert_eq!(Duration::from_secs(300), cfg.alerts.default_lookback);
		assert_eq!(100, cfg.alerts.history_limit);
		assert_eq!(Duration::from_secs(5), cfg.alerts.request_timeout);
		assert!(cfg.alertmanager.is_none());
		assert_eq!("logchef.db", cfg.metastore.path);
	}

	#[test]
	fn test_full_config() {
		let cfg = from_yaml(
			r#"
server:
  listen_addr: "127.0.0.1:9000"
  http_server_timeout: 45s
  log:
    file: stderr
    filter_directives: "debug,hyper=info"
metastore:
  path: /var/lib/logchef/meta.db
query:
  max_limit: 500
  default_timeout: 90s
alerts:
  enabled: false
  evaluation_interval: 30s
  default_lookback: 10m
  history_limit: 25
  tls_insecure_skip_verify: true
  smtp:
    host: smtp.example.com
    port: 587
    username: mailer
    password: hunter2
    from_address: alerts@example.com
    security: starttls
  webhook_url: https://hooks.example.com/logchef
alertmanager:
  url: http://alertmanager:9093/api/v2/alerts
"#,
		);
		cfg.validate().unwrap();
		assert_eq!(Duration::from_secs(45), cfg.server.http_server_timeout);
		assert_eq!(500, cfg.query.max_limit);
		assert!(!cfg.alerts.enabled);
		assert_eq!(Duration::from_secs(600), cfg.alerts.default_lookback);
		assert!(cfg.alerts.tls_insecure_skip_verify);
		let smtp = cfg.alerts.smtp.unwrap();
		assert_eq!(SmtpSecurity::Starttls, smtp.security);
		assert_eq!("alerts@example.com", smtp.from_address);
		assert_eq!(
			"http://alertmanager:9093/api/v2/alerts",
			cfg.alertmanager.unwrap().url
		);
	}

	#[test]
	fn test_validation_rejects_bad_values() {
		let cfg = from_yaml(
			r#"
server:
  listen_addr: "not-an-address"
"#,
		);
		assert!(cfg.validate().is_err());

		let cfg = from_yaml(
			r#"
server:
  listen_addr: "0.0.0.0:8125"
  log:
    file: stdout
    filter_directives: "wtf,,;asd"
"#,
		);
		assert!(cfg.validate().is_err());

		let cfg = from_yaml(
			r#"
server:
  listen_addr: "0.0.0.0:8125"
query:
  cache:
    time_to_live: 10s
    time_to_idle: 30s
"#,
		);
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn test_env_override() {
		// SERVICE_<SECTION>__<KEY>, double underscore at section boundaries
		env::set_var("SERVICE_QUERY__MAX_LIMIT", "250");
		let cfg: AppConfig = Config::builder()
			.add_source(config::File::from_str(
				"server:\n  listen_addr: \"0.0.0.0:8125\"\n",
				config::FileFormat::Yaml,
			))
			.add_source(
				Environment::with_prefix(ENV_PREFIX)
					.prefix_separator("_")
					.separator("__"),
			)
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap();
		env::remove_var("SERVICE_QUERY__MAX_LIMIT");
		assert_eq!(250, cfg.query.max_limit);
	}
}

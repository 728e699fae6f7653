use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Credentials for the embedded checkout-widget gateway.
#[derive(Clone, Debug, Deserialize)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: String,
    #[serde(default = "default_razorpay_base_url")]
    pub base_url: String,
}

/// Credentials for the redirect (UPI / wallet) gateway.
#[derive(Clone, Debug, Deserialize)]
pub struct PhonePeConfig {
    pub merchant_id: String,
    pub salt_key: String,
    #[serde(default = "default_phonepe_salt_index")]
    pub salt_index: u32,
    #[serde(default = "default_phonepe_base_url")]
    pub base_url: String,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// HS256 key used to validate bearer tokens
    #[validate(length(min = 32, message = "jwt_secret must be at least 32 characters"))]
    pub jwt_secret: String,

    #[serde(default = "default_auth_issuer")]
    pub auth_issuer: String,

    #[serde(default = "default_auth_audience")]
    pub auth_audience: String,

    pub host: String,

    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    #[validate(length(min = 1))]
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default = "default_true_bool")]
    pub auto_migrate: bool,

    /// Comma separated list of allowed CORS origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// ISO 4217 currency every order is charged in
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Charged when the discounted subtotal is below `free_shipping_threshold`
    #[serde(default = "default_shipping_flat_rate")]
    pub shipping_flat_rate: Decimal,

    #[serde(default = "default_free_shipping_threshold")]
    pub free_shipping_threshold: Decimal,

    /// Externally reachable base URL, used to build gateway callback URLs
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Where redirect gateways send the shopper once payment finishes
    #[serde(default = "default_payment_return_url")]
    pub payment_return_url: String,

    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub gateway_timeout_secs: u64,

    #[serde(default = "default_verify_poll_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub verify_poll_attempts: u32,

    #[serde(default = "default_verify_poll_interval_ms")]
    pub verify_poll_interval_ms: u64,

    #[serde(default = "default_circuit_breaker_failures")]
    #[validate(range(min = 1))]
    pub circuit_breaker_failure_threshold: u32,

    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_timeout_secs: u64,

    /// Enables the pending-order reconciliation sweep when set
    #[serde(default)]
    pub reconciliation_interval_secs: Option<u64>,

    #[serde(default = "default_reconciliation_min_age_secs")]
    pub reconciliation_min_age_secs: u64,

    /// Optional JSON file seeding the in-memory product catalog
    #[serde(default)]
    pub catalog_path: Option<String>,

    #[serde(default)]
    pub razorpay: Option<RazorpayConfig>,

    #[serde(default)]
    pub phonepe: Option<PhonePeConfig>,
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationErrors),
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            jwt_secret,
            auth_issuer: default_auth_issuer(),
            auth_audience: default_auth_audience(),
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            currency: default_currency(),
            shipping_flat_rate: default_shipping_flat_rate(),
            free_shipping_threshold: default_free_shipping_threshold(),
            public_base_url: default_public_base_url(),
            payment_return_url: default_payment_return_url(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            verify_poll_attempts: default_verify_poll_attempts(),
            verify_poll_interval_ms: default_verify_poll_interval_ms(),
            circuit_breaker_failure_threshold: default_circuit_breaker_failures(),
            circuit_breaker_timeout_secs: default_circuit_breaker_timeout(),
            reconciliation_interval_secs: None,
            reconciliation_min_age_secs: default_reconciliation_min_age_secs(),
            catalog_path: None,
            razorpay: None,
            phonepe: None,
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn verify_poll_interval(&self) -> Duration {
        Duration::from_millis(self.verify_poll_interval_ms)
    }

    /// URL a gateway posts its server-to-server confirmation to
    pub fn callback_url(&self, gateway: &str) -> String {
        format!(
            "{}/api/v1/payments/callback/{}",
            self.public_base_url.trim_end_matches('/'),
            gateway
        )
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.shipping_flat_rate < Decimal::ZERO || self.free_shipping_threshold < Decimal::ZERO
        {
            let mut err = ValidationError::new("shipping");
            err.message = Some("shipping amounts cannot be negative".into());
            errors.add("shipping_flat_rate", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections cannot exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if let Some(razorpay) = &self.razorpay {
            if razorpay.key_id.trim().is_empty() || razorpay.key_secret.trim().is_empty() {
                let mut err = ValidationError::new("razorpay");
                err.message = Some("razorpay key_id and key_secret are required".into());
                errors.add("razorpay", err);
            }
        }

        if let Some(phonepe) = &self.phonepe {
            if phonepe.merchant_id.trim().is_empty() || phonepe.salt_key.trim().is_empty() {
                let mut err = ValidationError::new("phonepe");
                err.message = Some("phonepe merchant_id and salt_key are required".into());
                errors.add("phonepe", err);
            }
        }

        if self.is_production() && self.cors_origins().is_empty() {
            let mut err = ValidationError::new("cors_allowed_origins");
            err.message = Some("production deployments must list allowed CORS origins".into());
            errors.add("cors_allowed_origins", err);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_true_bool() -> bool {
    true
}
fn default_auth_issuer() -> String {
    "storefront-auth".to_string()
}
fn default_auth_audience() -> String {
    "storefront-api".to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    30
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_currency() -> String {
    "INR".to_string()
}
fn default_shipping_flat_rate() -> Decimal {
    dec!(50)
}
fn default_free_shipping_threshold() -> Decimal {
    dec!(500)
}
fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_payment_return_url() -> String {
    "http://localhost:3000/orders".to_string()
}
fn default_gateway_timeout_secs() -> u64 {
    10
}
fn default_verify_poll_attempts() -> u32 {
    5
}
fn default_verify_poll_interval_ms() -> u64 {
    3000
}
fn default_circuit_breaker_failures() -> u32 {
    5
}
fn default_circuit_breaker_timeout() -> u64 {
    30
}
fn default_reconciliation_min_age_secs() -> u64 {
    300
}
fn default_razorpay_base_url() -> String {
    "https://api.razorpay.com".to_string()
}
fn default_phonepe_salt_index() -> u32 {
    1
}
fn default_phonepe_base_url() -> String {
    "https://api.phonepe.com/apis/hermes".to_string()
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // jwt_secret deliberately has no default
    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

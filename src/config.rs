use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_TAX_RATE_BPS: u32 = 900;
const DEFAULT_CURRENCY: &str = "IRR";
const DEFAULT_ORDER_NUMBER_PREFIX: &str = "ORD";
const DEFAULT_ORDER_NUMBER_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_PAYMENT_TIMEOUT_SECS: u64 = 10;
const DEV_DEFAULT_JWT_SECRET: &str = "development_only_checkout_secret_please_override";

/// Which payment provider adapter the server wires up.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProviderKind {
    #[default]
    Sandbox,
    Http,
}

/// One entry of the shipping method catalog.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShippingMethodConfig {
    pub id: String,
    pub name: String,
    /// Cost in minor currency units
    pub cost: i64,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins; permissive when unset in development
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// HS256 secret for bearer tokens
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Tax rate in basis points of the subtotal (900 = 9%)
    #[serde(default = "default_tax_rate_bps")]
    #[validate(range(max = 10000))]
    pub tax_rate_bps: u32,

    /// ISO currency code stamped on orders and payment requests
    #[serde(default = "default_currency")]
    #[validate(length(min = 3, max = 3))]
    pub currency: String,

    /// Prefix of generated order numbers (`{prefix}-{YYYYMMDD}-{NNNNNN}`)
    #[serde(default = "default_order_number_prefix")]
    #[validate(length(min = 1, max = 8))]
    pub order_number_prefix: String,

    /// Order-number collisions tolerated before giving up
    #[serde(default = "default_order_number_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub order_number_max_attempts: u32,

    /// Payment provider adapter
    #[serde(default)]
    pub payment_provider: PaymentProviderKind,

    /// Base URL of the HTTP payment provider API
    #[serde(default)]
    pub payment_api_base_url: Option<String>,

    /// Merchant identifier sent to the HTTP provider
    #[serde(default)]
    pub payment_merchant_id: Option<String>,

    /// URL the provider redirects the shopper back to
    #[serde(default = "default_payment_callback_url")]
    pub payment_callback_url: String,

    /// Base of the provider's hosted payment page; the session token is appended
    #[serde(default)]
    pub payment_redirect_base_url: Option<String>,

    /// Bound on every payment provider call
    #[serde(default = "default_payment_request_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub payment_request_timeout_secs: u64,

    /// Webhook secret for verifying provider notifications
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Webhook timestamp tolerance (seconds)
    #[serde(default)]
    pub payment_webhook_tolerance_secs: Option<u64>,

    /// Number of failures before circuit breaker opens
    #[serde(default = "default_circuit_breaker_failures")]
    pub circuit_breaker_failure_threshold: u32,

    /// Circuit breaker reset timeout in seconds
    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// Shipping method catalog offered at checkout
    #[serde(default = "default_shipping_methods")]
    #[validate(custom = "validate_shipping_methods")]
    pub shipping_methods: Vec<ShippingMethodConfig>,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials.
    pub fn new(database_url: String, jwt_secret: String, environment: String) -> Self {
        Self {
            database_url,
            host: "127.0.0.1".to_string(),
            port: default_port(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            jwt_secret,
            tax_rate_bps: default_tax_rate_bps(),
            currency: default_currency(),
            order_number_prefix: default_order_number_prefix(),
            order_number_max_attempts: default_order_number_max_attempts(),
            payment_provider: PaymentProviderKind::Sandbox,
            payment_api_base_url: None,
            payment_merchant_id: None,
            payment_callback_url: default_payment_callback_url(),
            payment_redirect_base_url: None,
            payment_request_timeout_secs: default_payment_request_timeout_secs(),
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: None,
            circuit_breaker_failure_threshold: default_circuit_breaker_failures(),
            circuit_breaker_timeout_secs: default_circuit_breaker_timeout(),
            event_channel_capacity: default_event_channel_capacity(),
            shipping_methods: default_shipping_methods(),
        }
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn payment_request_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_request_timeout_secs)
    }

    /// Explicit CORS origins, trimmed, empty entries dropped.
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development. Set APP__JWT_SECRET."
                    .into(),
            );
            errors.add("jwt_secret", err);
        }

        if self.payment_provider == PaymentProviderKind::Http {
            let required = [
                ("payment_api_base_url", &self.payment_api_base_url),
                ("payment_merchant_id", &self.payment_merchant_id),
                ("payment_redirect_base_url", &self.payment_redirect_base_url),
            ];
            for (field, value) in required {
                if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
                    let mut err = ValidationError::new("required_for_http_provider");
                    err.message =
                        Some("Required when payment_provider = \"http\"".into());
                    errors.add(field, err);
                }
            }
        }

        if url::Url::parse(&self.payment_callback_url).is_err() {
            let mut err = ValidationError::new("payment_callback_url");
            err.message = Some("payment_callback_url must be an absolute URL".into());
            errors.add("payment_callback_url", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_tax_rate_bps() -> u32 {
    DEFAULT_TAX_RATE_BPS
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_order_number_prefix() -> String {
    DEFAULT_ORDER_NUMBER_PREFIX.to_string()
}

fn default_order_number_max_attempts() -> u32 {
    DEFAULT_ORDER_NUMBER_MAX_ATTEMPTS
}

fn default_payment_callback_url() -> String {
    format!("http://localhost:{}/api/v1/payments/callback", DEFAULT_PORT)
}

fn default_payment_request_timeout_secs() -> u64 {
    DEFAULT_PAYMENT_TIMEOUT_SECS
}

fn default_circuit_breaker_failures() -> u32 {
    5
}

fn default_circuit_breaker_timeout() -> u64 {
    30
}

fn default_event_channel_capacity() -> usize {
    1024
}

pub fn default_shipping_methods() -> Vec<ShippingMethodConfig> {
    vec![
        ShippingMethodConfig {
            id: "post".to_string(),
            name: "Standard post".to_string(),
            cost: 50_000,
        },
        ShippingMethodConfig {
            id: "express".to_string(),
            name: "Express courier".to_string(),
            cost: 120_000,
        },
    ]
}

/// Validates log level values
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

fn validate_shipping_methods(methods: &Vec<ShippingMethodConfig>) -> Result<(), ValidationError> {
    if methods.is_empty() {
        let mut err = ValidationError::new("shipping_methods");
        err.message = Some("At least one shipping method must be configured".into());
        return Err(err);
    }

    let mut seen = HashSet::new();
    for method in methods {
        if method.id.trim().is_empty() || !seen.insert(method.id.as_str()) {
            let mut err = ValidationError::new("shipping_methods");
            err.message = Some("Shipping method ids must be non-empty and unique".into());
            return Err(err);
        }
        if method.cost < 0 {
            let mut err = ValidationError::new("shipping_methods");
            err.message = Some("Shipping method cost cannot be negative".into());
            return Err(err);
        }
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_checkout={},tower_http=debug", level);
    let filter = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(default_directive));

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. config/default.toml
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

    let config = Config::builder()
        .set_default("database_url", "sqlite://checkout.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to a random string of at least 32 characters.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
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

//! Metering configuration.

use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main metering configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeterConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Persistence configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Token-to-credit pricing.
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Interchangeable completion backends, in fallback order.
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,

    /// Provider routing configuration.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Job dispatch configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Admin and internal credentials.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Per-skill prompt settings for `/si/ask` and `si` jobs.
    #[serde(default)]
    pub skills: HashMap<String, SkillConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Global request quota for metered endpoints
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

fn default_listen_addr() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

fn default_requests_per_minute() -> u32 {
    600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the sled database directory
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Enable persistence (if false, everything is in-memory only)
    #[serde(default = "default_true")]
    pub persist: bool,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/data/metering")
}

fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            persist: true,
        }
    }
}

/// Pricing configuration for token-to-credit conversion.
#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// Credits per 1000 tokens (prompt + completion).
    /// Default: 0.05
    #[serde(default = "default_credits_per_1k")]
    pub credits_per_1k_tokens: Decimal,

    /// Floor applied to any call that consumed tokens.
    /// Default: 0 (no floor)
    #[serde(default)]
    pub minimum_charge: Decimal,

    /// Balance below which callers are warned.
    /// Default: 1
    #[serde(default = "default_warn_credits")]
    pub warn_credits: Decimal,
}

fn default_credits_per_1k() -> Decimal {
    Decimal::new(5, 2)
}

fn default_warn_credits() -> Decimal {
    Decimal::ONE
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            credits_per_1k_tokens: default_credits_per_1k(),
            minimum_charge: Decimal::ZERO,
            warn_credits: default_warn_credits(),
        }
    }
}

/// One interchangeable completion backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderDescriptor {
    /// Name used for routing preference and reporting.
    pub name: String,

    /// Model requested from the backend.
    pub model: String,

    /// OpenAI-compatible API base URL.
    pub base_url: String,

    /// Bearer credential.
    pub credential: SecretString,

    /// Request timeout
    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Provider tried first when a call does not name one.
    #[serde(default)]
    pub default_provider: Option<String>,

    /// Answer `/si/ask` with a zero-cost truncated echo when every provider fails.
    #[serde(default = "default_true")]
    pub degraded_fallback: bool,

    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
}

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            degraded_fallback: true,
            default_max_tokens: default_max_tokens(),
            default_temperature: default_temperature(),
        }
    }
}

/// How a freshly created job gets its first processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// POST `/admin/process-one` on `self_url` with the internal secret.
    Http,
    /// Spawn `process_one` on the local runtime.
    InProcess,
    /// Rely on the sweep only.
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_trigger_mode")]
    pub trigger: TriggerMode,

    /// Base URL this service is reachable at, for the HTTP trigger.
    #[serde(default = "default_self_url")]
    pub self_url: String,

    /// Run the periodic sweep inside this process.
    #[serde(default = "default_true")]
    pub sweep_enabled: bool,

    /// Interval between sweep ticks.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Upper bound on jobs processed per sweep tick.
    #[serde(default = "default_max_jobs_per_tick")]
    pub max_jobs_per_tick: usize,
}

fn default_trigger_mode() -> TriggerMode {
    TriggerMode::InProcess
}

fn default_self_url() -> String {
    "http://127.0.0.1:8080".into()
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_jobs_per_tick() -> usize {
    5
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            trigger: default_trigger_mode(),
            self_url: default_self_url(),
            sweep_enabled: true,
            sweep_interval: default_sweep_interval(),
            max_jobs_per_tick: default_max_jobs_per_tick(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Key required on admin endpoints (`x-admin-key`).
    #[serde(default)]
    pub admin_key: Option<SecretString>,

    /// Shared secret for internal job triggers (`x-internal-secret`).
    #[serde(default)]
    pub internal_secret: Option<SecretString>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillConfig {
    pub system_prompt: String,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub temperature: Option<f32>,
}

impl MeterConfig {
    /// Settings for a skill, falling back to a generic prompt.
    pub fn skill(&self, name: &str) -> SkillConfig {
        self.skills.get(name).cloned().unwrap_or_else(|| SkillConfig {
            system_prompt: format!(
                "You are the '{}' skill. Answer the user's input concisely.",
                name
            ),
            max_tokens: None,
            temperature: None,
        })
    }
}

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::OpenError;

const DEFAULT_URI: &str = "stub://front_camera";
const DEFAULT_DEVICE_INDEX: i32 = 0;
const DEFAULT_BACKOFF_BASE_MS: u64 = 200;
const DEFAULT_BACKOFF_CAP_MS: u64 = 5_000;
const DEFAULT_BACKOFF_JITTER: f64 = 0.2;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_STALL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 50;

/// Schemes accepted by `StreamUri::parse`. `stub` selects the synthetic backend.
/// Longest backoff or timeout a policy may carry.
pub const MAX_POLICY_DURATION: Duration = Duration::from_secs(3_600);
pub const SUPPORTED_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtspt", "stub"];

// ----------------------------------------------------------------------------
// Stream identity
// ----------------------------------------------------------------------------

/// A validated stream URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamUri {
    url: Url,
}

impl StreamUri {
    pub fn parse(raw: &str) -> Result<Self, OpenError> {
        let invalid = |reason: String| OpenError::InvalidUri {
            uri: raw.to_string(),
            reason,
        };
        let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(invalid(format!(
                "unsupported scheme '{}'; expected one of {}",
                url.scheme(),
                SUPPORTED_SCHEMES.join(", ")
            )));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }
        Ok(Self { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn is_stub(&self) -> bool {
        self.url.scheme() == "stub"
    }

    /// Full URI, including any inline credentials. Never log this.
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// URI with the password removed, safe for logs.
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some("***"));
        }
        url.to_string()
    }
}

impl std::fmt::Display for StreamUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Which hardware conversion path the pipeline uses.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecoderFlavor {
    /// `cudaconvert` into `memory:CUDAMemory` BGRA.
    #[default]
    Cuda,
    /// `nvvideoconvert` into `memory:NVMM` RGBA surfaces.
    DeepStream,
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub uri: String,
    pub credentials: Option<Credentials>,
    pub flavor: DecoderFlavor,
    /// GPU the decoder and converter run on.
    pub device_index: i32,
}

impl StreamConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            credentials: None,
            flavor: DecoderFlavor::default(),
            device_index: DEFAULT_DEVICE_INDEX,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: Option<&str>) -> Self {
        self.credentials = Some(Credentials::new(username, password.map(str::to_string)));
        self
    }
}

// ----------------------------------------------------------------------------
// Supervision policy
// ----------------------------------------------------------------------------

/// What a cleanly ended remote stream means.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndOfStreamPolicy {
    /// RTSP cameras routinely drop and come back; reconnect.
    #[default]
    Reconnect,
    /// Treat the end as final.
    Terminal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SupervisorPolicy {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Fraction of each delay that is randomised, in `[0, 1]`.
    pub backoff_jitter: f64,
    /// Reconnect attempts allowed before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    pub end_of_stream: EndOfStreamPolicy,
    /// Time a new pipeline has to deliver its first frame.
    pub connect_timeout: Duration,
    /// Time a live pipeline may go without a frame.
    pub stall_timeout: Duration,
    /// Upper bound on how long one backend poll may wait.
    pub poll_timeout: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
            max_retries: None,
            end_of_stream: EndOfStreamPolicy::default(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            stall_timeout: Duration::from_millis(DEFAULT_STALL_TIMEOUT_MS),
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        }
    }
}

impl SupervisorPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.backoff_base.is_zero() {
            return Err(anyhow!("backoff base must be greater than zero"));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(anyhow!("backoff cap must not be below the backoff base"));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(anyhow!("backoff jitter must be within [0, 1]"));
        }
        for (name, value) in [
            ("connect timeout", self.connect_timeout),
            ("stall timeout", self.stall_timeout),
            ("poll timeout", self.poll_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        for (name, value) in [
            ("backoff cap", self.backoff_cap),
            ("connect timeout", self.connect_timeout),
            ("stall timeout", self.stall_timeout),
            ("poll timeout", self.poll_timeout),
        ] {
            if value > MAX_POLICY_DURATION {
                return Err(anyhow!(
                    "{} must not exceed {:?}",
                    name,
                    MAX_POLICY_DURATION
                ));
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// File + environment loading
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct StreamSettingsFile {
    uri: Option<String>,
    username: Option<String>,
    password: Option<String>,
    flavor: Option<DecoderFlavor>,
    device_index: Option<i32>,
    reconnect: Option<ReconnectConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
    backoff_jitter: Option<f64>,
    max_retries: Option<u32>,
    end_of_stream: Option<EndOfStreamPolicy>,
    connect_timeout_ms: Option<u64>,
    stall_timeout_ms: Option<u64>,
    poll_timeout_ms: Option<u64>,
}

/// Stream plus supervision settings, as loaded by binaries.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub stream: StreamConfig,
    pub policy: SupervisorPolicy,
}

impl StreamSettings {
    /// Load from `VISION_STREAM_CONFIG` (JSON, or TOML by extension), then apply environment
    /// overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VISION_STREAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file instead of `VISION_STREAM_CONFIG`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamSettingsFile) -> Self {
        let credentials = file
            .username
            .map(|username| Credentials::new(username, file.password));
        let stream = StreamConfig {
            uri: file.uri.unwrap_or_else(|| DEFAULT_URI.to_string()),
            credentials,
            flavor: file.flavor.unwrap_or_default(),
            device_index: file.device_index.unwrap_or(DEFAULT_DEVICE_INDEX),
        };

        let reconnect = file.reconnect.unwrap_or_default();
        let defaults = SupervisorPolicy::default();
        let millis = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        let policy = SupervisorPolicy {
            backoff_base: millis(reconnect.backoff_base_ms, defaults.backoff_base),
            backoff_cap: millis(reconnect.backoff_cap_ms, defaults.backoff_cap),
            backoff_jitter: reconnect.backoff_jitter.unwrap_or(defaults.backoff_jitter),
            max_retries: reconnect.max_retries.or(defaults.max_retries),
            end_of_stream: reconnect.end_of_stream.unwrap_or(defaults.end_of_stream),
            connect_timeout: millis(reconnect.connect_timeout_ms, defaults.connect_timeout),
            stall_timeout: millis(reconnect.stall_timeout_ms, defaults.stall_timeout),
            poll_timeout: millis(reconnect.poll_timeout_ms, defaults.poll_timeout),
        };

        Self { stream, policy }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(uri) = std::env::var("VISION_STREAM_URI") {
            if !uri.trim().is_empty() {
                self.stream.uri = uri;
            }
        }
        if let Ok(username) = std::env::var("VISION_STREAM_USERNAME") {
            if !username.trim().is_empty() {
                let password = self
                    .stream
                    .credentials
                    .take()
                    .and_then(|creds| creds.password);
                self.stream.credentials = Some(Credentials::new(username, password));
            }
        }
        if let Ok(password) = std::env::var("VISION_STREAM_PASSWORD") {
            match self.stream.credentials.as_mut() {
                Some(creds) => creds.password = Some(password),
                None => {
                    return Err(anyhow!(
                        "VISION_STREAM_PASSWORD requires a username (VISION_STREAM_USERNAME)"
                    ))
                }
            }
        }
        if let Ok(device) = std::env::var("VISION_STREAM_DEVICE") {
            self.stream.device_index = device
                .parse()
                .map_err(|_| anyhow!("VISION_STREAM_DEVICE must be an integer device index"))?;
        }
        if let Ok(retries) = std::env::var("VISION_STREAM_MAX_RETRIES") {
            self.policy.max_retries = if retries.trim().is_empty() {
                None
            } else {
                Some(retries.parse().map_err(|_| {
                    anyhow!("VISION_STREAM_MAX_RETRIES must be a non-negative integer")
                })?)
            };
        }
        if let Ok(flag) = std::env::var("VISION_STREAM_EOS_TERMINAL") {
            self.policy.end_of_stream = match flag.trim() {
                "1" | "true" | "yes" => EndOfStreamPolicy::Terminal,
                "0" | "false" | "no" | "" => EndOfStreamPolicy::Reconnect,
                other => {
                    return Err(anyhow!(
                        "VISION_STREAM_EOS_TERMINAL must be a boolean, got '{}'",
                        other
                    ))
                }
            };
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        StreamUri::parse(&self.stream.uri)?;
        if self.stream.device_index < 0 {
            return Err(anyhow!("device index must not be negative"));
        }
        self.policy.validate()
    }
}

fn read_config_file(path: &Path) -> Result<StreamSettingsFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

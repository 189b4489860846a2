// Publisher and subscriber defaults plus env/YAML override loading.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::error::ConfigError;

pub(crate) const DEFAULT_ELEMENT_COUNT_THRESHOLD: usize = 100;
pub(crate) const DEFAULT_REQUEST_BYTES_THRESHOLD: usize = 1000;
pub(crate) const DEFAULT_DELAY_THRESHOLD: Duration = Duration::from_millis(1);
pub(crate) const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(600);
pub(crate) const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_RETRY_DELAY_MULTIPLIER: f64 = 4.0;
pub(crate) const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_INITIAL_RPC_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_RPC_TIMEOUT_MULTIPLIER: f64 = 4.0;
pub(crate) const DEFAULT_MAX_RPC_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const MIN_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const MIN_RPC_TIMEOUT: Duration = Duration::from_millis(10);
pub(crate) const DEFAULT_COMPRESSION_BYTES_THRESHOLD: usize = 240;

pub(crate) const DEFAULT_SUB_MAX_OUTSTANDING_MESSAGES: u64 = 1000;
pub(crate) const DEFAULT_SUB_MAX_OUTSTANDING_BYTES: u64 = 100 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_ACK_EXTENSION_PERIOD: Duration = Duration::from_secs(60 * 60);
pub(crate) const DEFAULT_MIN_ACK_EXTENSION_EXACTLY_ONCE: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_PARALLEL_PULL_COUNT: usize = 1;

/// Floor and ceiling the broker accepts for a single ack deadline.
pub(crate) const MIN_ACK_DEADLINE: Duration = Duration::from_secs(10);
pub(crate) const MAX_ACK_DEADLINE: Duration = Duration::from_secs(600);
pub(crate) const DEFAULT_STREAM_ACK_DEADLINE: Duration = Duration::from_secs(60);

/// Lead time before a lease lapses at which the next extension is sent.
pub(crate) const ACK_EXPIRATION_PADDING: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitExceededBehavior {
    /// Wait (FIFO) until capacity frees up.
    Block,
    /// Fail the operation immediately.
    FailFast,
    /// Do not account at all.
    #[default]
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControlSettings {
    pub max_outstanding_element_count: Option<u64>,
    pub max_outstanding_request_bytes: Option<u64>,
    pub limit_exceeded_behavior: LimitExceededBehavior,
}

impl FlowControlSettings {
    pub fn publisher_default() -> Self {
        Self {
            max_outstanding_element_count: None,
            max_outstanding_request_bytes: None,
            limit_exceeded_behavior: LimitExceededBehavior::Ignore,
        }
    }

    pub fn subscriber_default() -> Self {
        Self {
            max_outstanding_element_count: Some(DEFAULT_SUB_MAX_OUTSTANDING_MESSAGES),
            max_outstanding_request_bytes: Some(DEFAULT_SUB_MAX_OUTSTANDING_BYTES),
            limit_exceeded_behavior: LimitExceededBehavior::Block,
        }
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.limit_exceeded_behavior == LimitExceededBehavior::Ignore {
            return Ok(());
        }
        match (
            self.max_outstanding_element_count,
            self.max_outstanding_request_bytes,
        ) {
            (Some(elements), Some(bytes)) if elements > 0 && bytes > 0 => Ok(()),
            _ => Err(ConfigError::new(
                "flow control limits must both be positive unless the behavior is ignore",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchingSettings {
    pub element_count_threshold: usize,
    pub request_byte_threshold: usize,
    pub delay_threshold: Duration,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            element_count_threshold: DEFAULT_ELEMENT_COUNT_THRESHOLD,
            request_byte_threshold: DEFAULT_REQUEST_BYTES_THRESHOLD,
            delay_threshold: DEFAULT_DELAY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub total_timeout: Duration,
    pub initial_retry_delay: Duration,
    pub retry_delay_multiplier: f64,
    pub max_retry_delay: Duration,
    pub initial_rpc_timeout: Duration,
    pub rpc_timeout_multiplier: f64,
    pub max_rpc_timeout: Duration,
    /// Zero means unlimited.
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
            initial_retry_delay: DEFAULT_INITIAL_RETRY_DELAY,
            retry_delay_multiplier: DEFAULT_RETRY_DELAY_MULTIPLIER,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            initial_rpc_timeout: DEFAULT_INITIAL_RPC_TIMEOUT,
            rpc_timeout_multiplier: DEFAULT_RPC_TIMEOUT_MULTIPLIER,
            max_rpc_timeout: DEFAULT_MAX_RPC_TIMEOUT,
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    pub topic: String,
    pub batching: BatchingSettings,
    pub flow_control: FlowControlSettings,
    pub retry: RetrySettings,
    pub enable_message_ordering: bool,
    pub enable_compression: bool,
    pub compression_bytes_threshold: usize,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct PublisherConfigOverride {
    batch_max_messages: Option<usize>,
    batch_max_bytes: Option<usize>,
    batch_delay_ms: Option<u64>,
    flow_max_messages: Option<u64>,
    flow_max_bytes: Option<u64>,
    flow_behavior: Option<LimitExceededBehavior>,
    total_timeout_ms: Option<u64>,
    initial_retry_delay_ms: Option<u64>,
    max_retry_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
    enable_message_ordering: Option<bool>,
    enable_compression: Option<bool>,
    compression_bytes_threshold: Option<usize>,
}

impl PublisherConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            batching: BatchingSettings::default(),
            flow_control: FlowControlSettings::publisher_default(),
            retry: RetrySettings::default(),
            enable_message_ordering: false,
            enable_compression: false,
            compression_bytes_threshold: DEFAULT_COMPRESSION_BYTES_THRESHOLD,
        }
    }

    pub fn from_env(topic: impl Into<String>) -> Self {
        let mut config = Self::new(topic);
        if let Some(value) = read_usize_env("KESTREL_PUBLISH_BATCH_MAX_MESSAGES") {
            config.batching.element_count_threshold = value;
        }
        if let Some(value) = read_usize_env("KESTREL_PUBLISH_BATCH_MAX_BYTES") {
            config.batching.request_byte_threshold = value;
        }
        if let Some(value) = read_u64_env("KESTREL_PUBLISH_BATCH_DELAY_MS") {
            config.batching.delay_threshold = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("KESTREL_PUBLISH_FLOW_MAX_MESSAGES") {
            config.flow_control.max_outstanding_element_count = Some(value);
        }
        if let Some(value) = read_u64_env("KESTREL_PUBLISH_FLOW_MAX_BYTES") {
            config.flow_control.max_outstanding_request_bytes = Some(value);
        }
        if let Some(value) = read_behavior_env("KESTREL_PUBLISH_FLOW_BEHAVIOR") {
            config.flow_control.limit_exceeded_behavior = value;
        }
        if let Some(value) = read_u64_env("KESTREL_PUBLISH_TOTAL_TIMEOUT_MS") {
            config.retry.total_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("KESTREL_PUBLISH_MAX_ATTEMPTS") {
            config.retry.max_attempts = u32::try_from(value).unwrap_or(u32::MAX);
        }
        if let Some(value) = read_bool_env("KESTREL_PUBLISH_ORDERING") {
            config.enable_message_ordering = value;
        }
        if let Some(value) = read_bool_env("KESTREL_PUBLISH_COMPRESSION") {
            config.enable_compression = value;
        }
        if let Some(value) = read_usize_env("KESTREL_PUBLISH_COMPRESSION_THRESHOLD") {
            config.compression_bytes_threshold = value;
        }
        config
    }

    pub fn from_env_or_yaml(topic: impl Into<String>, config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env(topic);
        if let Some(contents) = read_override_file(config_path, "KESTREL_PUBLISHER_CONFIG")? {
            let override_cfg: PublisherConfigOverride =
                serde_yaml::from_str(&contents).context("parse publisher config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.topic.is_empty() {
            return Err(ConfigError::new("topic must not be empty"));
        }
        if self.batching.element_count_threshold == 0 {
            return Err(ConfigError::new("batch element count threshold must be positive"));
        }
        if self.batching.request_byte_threshold == 0 {
            return Err(ConfigError::new("batch byte threshold must be positive"));
        }
        if self.batching.delay_threshold.is_zero() {
            return Err(ConfigError::new("batch delay threshold must be positive"));
        }
        self.flow_control.validate()?;
        if self.retry.total_timeout < MIN_TOTAL_TIMEOUT {
            return Err(ConfigError::new(format!(
                "retry total timeout must be at least {MIN_TOTAL_TIMEOUT:?}"
            )));
        }
        if self.retry.initial_rpc_timeout < MIN_RPC_TIMEOUT {
            return Err(ConfigError::new(format!(
                "initial rpc timeout must be at least {MIN_RPC_TIMEOUT:?}"
            )));
        }
        Ok(())
    }
}

impl PublisherConfigOverride {
    fn apply(&self, config: &mut PublisherConfig) {
        if let Some(value) = self.batch_max_messages
            && value > 0
        {
            config.batching.element_count_threshold = value;
        }
        if let Some(value) = self.batch_max_bytes
            && value > 0
        {
            config.batching.request_byte_threshold = value;
        }
        if let Some(value) = self.batch_delay_ms
            && value > 0
        {
            config.batching.delay_threshold = Duration::from_millis(value);
        }
        if let Some(value) = self.flow_max_messages
            && value > 0
        {
            config.flow_control.max_outstanding_element_count = Some(value);
        }
        if let Some(value) = self.flow_max_bytes
            && value > 0
        {
            config.flow_control.max_outstanding_request_bytes = Some(value);
        }
        if let Some(value) = self.flow_behavior {
            config.flow_control.limit_exceeded_behavior = value;
        }
        if let Some(value) = self.total_timeout_ms
            && value > 0
        {
            config.retry.total_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.initial_retry_delay_ms
            && value > 0
        {
            config.retry.initial_retry_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.max_retry_delay_ms
            && value > 0
        {
            config.retry.max_retry_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.max_attempts {
            config.retry.max_attempts = value;
        }
        if let Some(value) = self.enable_message_ordering {
            config.enable_message_ordering = value;
        }
        if let Some(value) = self.enable_compression {
            config.enable_compression = value;
        }
        if let Some(value) = self.compression_bytes_threshold
            && value > 0
        {
            config.compression_bytes_threshold = value;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Let leased messages finish processing before releasing resources.
    #[default]
    WaitForProcessing,
    /// Nack every outstanding message and return.
    NackImmediately,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriberShutdownSettings {
    pub mode: ShutdownMode,
    /// `None` waits indefinitely; zero returns without waiting.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    pub subscription: String,
    /// The subscriber always blocks on these limits; the behavior field is ignored.
    pub flow_control: FlowControlSettings,
    pub max_ack_extension_period: Duration,
    pub min_duration_per_ack_extension: Option<Duration>,
    pub max_duration_per_ack_extension: Option<Duration>,
    pub parallel_pull_count: usize,
    pub shutdown: SubscriberShutdownSettings,
    /// Initial exactly-once mode; the broker's subscription properties take over once streaming.
    pub exactly_once_delivery: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct SubscriberConfigOverride {
    max_outstanding_messages: Option<u64>,
    max_outstanding_bytes: Option<u64>,
    max_ack_extension_secs: Option<u64>,
    min_extension_secs: Option<u64>,
    max_extension_secs: Option<u64>,
    parallel_pull_count: Option<usize>,
    shutdown_mode: Option<ShutdownMode>,
    shutdown_timeout_ms: Option<u64>,
    exactly_once_delivery: Option<bool>,
}

impl SubscriberConfig {
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            flow_control: FlowControlSettings::subscriber_default(),
            max_ack_extension_period: DEFAULT_MAX_ACK_EXTENSION_PERIOD,
            min_duration_per_ack_extension: None,
            max_duration_per_ack_extension: None,
            parallel_pull_count: DEFAULT_PARALLEL_PULL_COUNT,
            shutdown: SubscriberShutdownSettings::default(),
            exactly_once_delivery: false,
        }
    }

    pub fn from_env(subscription: impl Into<String>) -> Self {
        let mut config = Self::new(subscription);
        if let Some(value) = read_u64_env("KESTREL_SUB_MAX_OUTSTANDING_MESSAGES") {
            config.flow_control.max_outstanding_element_count = Some(value);
        }
        if let Some(value) = read_u64_env("KESTREL_SUB_MAX_OUTSTANDING_BYTES") {
            config.flow_control.max_outstanding_request_bytes = Some(value);
        }
        if let Some(value) = read_u64_env("KESTREL_SUB_MAX_ACK_EXTENSION_SECS") {
            config.max_ack_extension_period = Duration::from_secs(value);
        }
        if let Some(value) = read_u64_env("KESTREL_SUB_MIN_EXTENSION_SECS") {
            config.min_duration_per_ack_extension = Some(Duration::from_secs(value));
        }
        if let Some(value) = read_u64_env("KESTREL_SUB_MAX_EXTENSION_SECS") {
            config.max_duration_per_ack_extension = Some(Duration::from_secs(value));
        }
        if let Some(value) = read_usize_env("KESTREL_SUB_PARALLEL_PULL_COUNT") {
            config.parallel_pull_count = value;
        }
        if let Some(value) = read_shutdown_mode_env("KESTREL_SUB_SHUTDOWN_MODE") {
            config.shutdown.mode = value;
        }
        if let Some(value) = read_u64_env("KESTREL_SUB_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown.timeout = Some(Duration::from_millis(value));
        }
        if let Some(value) = read_bool_env("KESTREL_SUB_EXACTLY_ONCE") {
            config.exactly_once_delivery = value;
        }
        config
    }

    pub fn from_env_or_yaml(
        subscription: impl Into<String>,
        config_path: Option<&str>,
    ) -> Result<Self> {
        let mut config = Self::from_env(subscription);
        if let Some(contents) = read_override_file(config_path, "KESTREL_SUBSCRIBER_CONFIG")? {
            let override_cfg: SubscriberConfigOverride =
                serde_yaml::from_str(&contents).context("parse subscriber config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.subscription.is_empty() {
            return Err(ConfigError::new("subscription must not be empty"));
        }
        if self.parallel_pull_count == 0 {
            return Err(ConfigError::new("parallel pull count must be at least 1"));
        }
        let blocking = FlowControlSettings {
            limit_exceeded_behavior: LimitExceededBehavior::Block,
            ..self.flow_control.clone()
        };
        blocking.validate()?;
        if let (Some(min), Some(max)) = (
            self.min_duration_per_ack_extension,
            self.max_duration_per_ack_extension,
        ) && min >= max
        {
            return Err(ConfigError::new(
                "min duration per ack extension must be below the max duration",
            ));
        }
        Ok(())
    }

    /// Deadline announced when opening a stream.
    pub(crate) fn stream_ack_deadline(&self) -> Duration {
        match self.max_duration_per_ack_extension {
            None => DEFAULT_STREAM_ACK_DEADLINE,
            Some(max) => max.clamp(MIN_ACK_DEADLINE, MAX_ACK_DEADLINE),
        }
    }
}

impl SubscriberConfigOverride {
    fn apply(&self, config: &mut SubscriberConfig) {
        if let Some(value) = self.max_outstanding_messages
            && value > 0
        {
            config.flow_control.max_outstanding_element_count = Some(value);
        }
        if let Some(value) = self.max_outstanding_bytes
            && value > 0
        {
            config.flow_control.max_outstanding_request_bytes = Some(value);
        }
        if let Some(value) = self.max_ack_extension_secs {
            config.max_ack_extension_period = Duration::from_secs(value);
        }
        if let Some(value) = self.min_extension_secs {
            config.min_duration_per_ack_extension = Some(Duration::from_secs(value));
        }
        if let Some(value) = self.max_extension_secs {
            config.max_duration_per_ack_extension = Some(Duration::from_secs(value));
        }
        if let Some(value) = self.parallel_pull_count
            && value > 0
        {
            config.parallel_pull_count = value;
        }
        if let Some(value) = self.shutdown_mode {
            config.shutdown.mode = value;
        }
        if let Some(value) = self.shutdown_timeout_ms {
            config.shutdown.timeout = Some(Duration::from_millis(value));
        }
        if let Some(value) = self.exactly_once_delivery {
            config.exactly_once_delivery = value;
        }
    }
}

fn read_override_file(config_path: Option<&str>, env_key: &str) -> Result<Option<String>> {
    let override_path = config_path
        .map(|value| value.to_string())
        .or_else(|| std::env::var(env_key).ok());
    match override_path.as_deref() {
        Some(path) => fs::read_to_string(path)
            .map(Some)
            .with_context(|| format!("read config: {path}")),
        None => Ok(None),
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}

fn read_behavior_env(key: &str) -> Option<LimitExceededBehavior> {
    match std::env::var(key).ok()?.as_str() {
        "block" => Some(LimitExceededBehavior::Block),
        "fail_fast" => Some(LimitExceededBehavior::FailFast),
        "ignore" => Some(LimitExceededBehavior::Ignore),
        _ => None,
    }
}

fn read_shutdown_mode_env(key: &str) -> Option<ShutdownMode> {
    match std::env::var(key).ok()?.as_str() {
        "wait_for_processing" => Some(ShutdownMode::WaitForProcessing),
        "nack_immediately" => Some(ShutdownMode::NackImmediately),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct EnvGuard(&'static [&'static str]);

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in self.0 {
                unsafe { std::env::remove_var(key) };
            }
        }
    }

    #[test]
    fn publisher_defaults_match_documented_values() {
        let config = PublisherConfig::new("projects/p/topics/t");
        assert_eq!(config.batching.element_count_threshold, 100);
        assert_eq!(config.batching.request_byte_threshold, 1000);
        assert_eq!(config.batching.delay_threshold, Duration::from_millis(1));
        assert_eq!(
            config.flow_control.limit_exceeded_behavior,
            LimitExceededBehavior::Ignore
        );
        assert_eq!(config.retry.max_attempts, 0);
        assert_eq!(config.compression_bytes_threshold, 240);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn subscriber_defaults_match_documented_values() {
        let config = SubscriberConfig::new("projects/p/subscriptions/s");
        assert_eq!(config.flow_control.max_outstanding_element_count, Some(1000));
        assert_eq!(
            config.flow_control.max_outstanding_request_bytes,
            Some(100 * 1024 * 1024)
        );
        assert_eq!(config.max_ack_extension_period, Duration::from_secs(3600));
        assert_eq!(config.shutdown.mode, ShutdownMode::WaitForProcessing);
        assert_eq!(config.shutdown.timeout, None);
        assert_eq!(config.stream_ack_deadline(), Duration::from_secs(60));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn stream_ack_deadline_clamps_configured_max_extension() {
        let mut config = SubscriberConfig::new("s");
        config.max_duration_per_ack_extension = Some(Duration::from_secs(3));
        assert_eq!(config.stream_ack_deadline(), Duration::from_secs(10));
        config.max_duration_per_ack_extension = Some(Duration::from_secs(3600));
        assert_eq!(config.stream_ack_deadline(), Duration::from_secs(600));
        config.max_duration_per_ack_extension = Some(Duration::from_secs(120));
        assert_eq!(config.stream_ack_deadline(), Duration::from_secs(120));
    }

    #[test]
    fn publisher_validation_rejects_bad_thresholds() {
        let mut config = PublisherConfig::new("t");
        config.batching.element_count_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = PublisherConfig::new("t");
        config.flow_control.limit_exceeded_behavior = LimitExceededBehavior::Block;
        assert!(config.validate().is_err());

        let mut config = PublisherConfig::new("t");
        config.retry.total_timeout = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn subscriber_validation_requires_min_below_max() {
        let mut config = SubscriberConfig::new("s");
        config.min_duration_per_ack_extension = Some(Duration::from_secs(30));
        config.max_duration_per_ack_extension = Some(Duration::from_secs(30));
        assert!(config.validate().is_err());
        config.max_duration_per_ack_extension = Some(Duration::from_secs(31));
        config.validate().expect("valid");
    }

    #[test]
    #[serial_test::serial]
    fn publisher_env_overrides_defaults() {
        let _guard = EnvGuard(&[
            "KESTREL_PUBLISH_BATCH_MAX_MESSAGES",
            "KESTREL_PUBLISH_FLOW_BEHAVIOR",
            "KESTREL_PUBLISH_ORDERING",
        ]);
        unsafe {
            std::env::set_var("KESTREL_PUBLISH_BATCH_MAX_MESSAGES", "7");
            std::env::set_var("KESTREL_PUBLISH_FLOW_BEHAVIOR", "fail_fast");
            std::env::set_var("KESTREL_PUBLISH_ORDERING", "true");
        }
        let config = PublisherConfig::from_env("t");
        assert_eq!(config.batching.element_count_threshold, 7);
        assert_eq!(
            config.flow_control.limit_exceeded_behavior,
            LimitExceededBehavior::FailFast
        );
        assert!(config.enable_message_ordering);
    }

    #[test]
    #[serial_test::serial]
    fn subscriber_yaml_overrides_env() {
        let _guard = EnvGuard(&["KESTREL_SUB_PARALLEL_PULL_COUNT"]);
        unsafe { std::env::set_var("KESTREL_SUB_PARALLEL_PULL_COUNT", "2") };
        let yaml = r#"
parallel_pull_count: 4
shutdown_mode: nack_immediately
shutdown_timeout_ms: 2500
max_outstanding_messages: 0
"#;
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(yaml.as_bytes()).expect("write");
        let path = file.path().to_str().expect("path");

        let config = SubscriberConfig::from_env_or_yaml("s", Some(path)).expect("config");
        assert_eq!(config.parallel_pull_count, 4);
        assert_eq!(config.shutdown.mode, ShutdownMode::NackImmediately);
        assert_eq!(config.shutdown.timeout, Some(Duration::from_millis(2500)));
        // Zero values are ignored.
        assert_eq!(config.flow_control.max_outstanding_element_count, Some(1000));
    }

    #[test]
    fn invalid_yaml_returns_error() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(b"batch_max_messages: [oops").expect("write");
        let path = file.path().to_str().expect("path");
        assert!(PublisherConfig::from_env_or_yaml("t", Some(path)).is_err());
    }

    #[test]
    fn missing_yaml_file_returns_error() {
        let err = PublisherConfig::from_env_or_yaml("t", Some("/nonexistent/kestrel.yaml"))
            .expect_err("missing file");
        assert!(err.to_string().contains("read config"));
    }
}

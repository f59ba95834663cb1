//! Structured logging with JSON/pretty/compact formats and parameter redaction.
//!
//! Task parameters are caller-supplied and routinely carry credentials for
//! the systems an executor talks to, so anything logged from them goes
//! through [`redact_parameters`] first.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Global redactor, configured by [`init_logging`].
static REDACTOR: OnceLock<SensitiveFieldRedactor> = OnceLock::new();

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Per-module log levels, e.g. `conductor_core::store = "debug"`
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Whether to include file/line information
    #[serde(default)]
    pub include_location: bool,

    /// Whether to include target (module path)
    #[serde(default = "default_include_target")]
    pub include_target: bool,

    #[serde(default)]
    pub redaction: RedactionConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: false,
            include_target: default_include_target(),
            redaction: RedactionConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines for log shippers
    #[default]
    Json,
    /// Multi-line, human oriented
    Pretty,
    /// Single-line, human oriented
    Compact,
}

/// Which parameter keys and values are masked.
#[derive(Debug, Clone, Deserialize)]
pub struct RedactionConfig {
    #[serde(default = "default_redaction_enabled")]
    pub enabled: bool,

    /// Key fragments matched case-insensitively
    #[serde(default = "default_sensitive_keys")]
    pub sensitive_keys: Vec<String>,

    /// Regexes masked inside any string value
    #[serde(default = "default_value_patterns")]
    pub value_patterns: Vec<String>,

    #[serde(default = "default_redaction_replacement")]
    pub replacement: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_redaction_enabled(),
            sensitive_keys: default_sensitive_keys(),
            value_patterns: default_value_patterns(),
            replacement: default_redaction_replacement(),
        }
    }
}

/// Masks sensitive keys and values in JSON documents.
#[derive(Debug, Clone)]
pub struct SensitiveFieldRedactor {
    keys: Vec<String>,
    values: Vec<regex::Regex>,
    replacement: String,
    enabled: bool,
}

impl SensitiveFieldRedactor {
    /// Build from configuration. Invalid value patterns are skipped with a warning.
    pub fn new(config: &RedactionConfig) -> Self {
        let values = config
            .value_patterns
            .iter()
            .filter_map(|pattern| match regex::Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "Ignoring invalid redaction pattern");
                    None
                }
            })
            .collect();

        Self {
            keys: config.sensitive_keys.iter().map(|k| k.to_lowercase()).collect(),
            values,
            replacement: config.replacement.clone(),
            enabled: config.enabled,
        }
    }

    pub fn should_redact_field(&self, field_name: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let lower = field_name.to_lowercase();
        self.keys.iter().any(|k| lower.contains(k.as_str()))
    }

    pub fn redact_value(&self, value: &str) -> String {
        if !self.enabled {
            return value.to_string();
        }
        self.values.iter().fold(value.to_string(), |acc, regex| {
            regex.replace_all(&acc, self.replacement.as_str()).into_owned()
        })
    }

    /// Copy of `value` with sensitive entries masked, at any depth.
    pub fn redact_json(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.redact_map(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_json(v)).collect()),
            Value::String(s) => Value::String(self.redact_value(s)),
            other => other.clone(),
        }
    }

    fn redact_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                let value = if self.should_redact_field(key) {
                    Value::String(self.replacement.clone())
                } else {
                    self.redact_json(value)
                };
                (key.clone(), value)
            })
            .collect()
    }

    pub fn global() -> &'static SensitiveFieldRedactor {
        REDACTOR.get_or_init(|| SensitiveFieldRedactor::new(&RedactionConfig::default()))
    }
}

/// Task parameters with sensitive entries masked, ready to log.
pub fn redact_parameters(parameters: &Map<String, Value>) -> Value {
    Value::Object(SensitiveFieldRedactor::global().redact_map(parameters))
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_include_target() -> bool {
    true
}

fn default_redaction_enabled() -> bool {
    true
}

fn default_redaction_replacement() -> String {
    "[REDACTED]".to_string()
}

fn default_sensitive_keys() -> Vec<String> {
    ["token", "secret", "password", "passwd", "api_key", "apikey", "authorization", "credential"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_value_patterns() -> Vec<String> {
    vec![
        r"sk-[a-zA-Z0-9]{20,}".to_string(),
        r"eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+".to_string(),
        r"(?i)bearer\s+[a-z0-9._~+/-]+=*".to_string(),
    ]
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if a level directive does not parse or a subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let _ = REDACTOR.set(SensitiveFieldRedactor::new(&config.redaction));

    let mut filter = EnvFilter::try_new(&config.level)?;
    for (module, level) in &config.module_levels {
        filter = filter.add_directive(format!("{}={}", module, level).parse()?);
    }

    match config.format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_target(config.include_target);
            tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_target(config.include_target);
            tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_target(config.include_target);
            tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
        }
    }

    Ok(())
}

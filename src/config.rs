use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// When a session hands its physical connection back to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionReleaseMode {
    /// Release after every statement once no resources are held open.
    AfterStatement,
    /// Release when the transaction completes.
    AfterTransaction,
    /// Keep the connection until the session is closed.
    OnClose,
}

impl FromStr for ConnectionReleaseMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "after_statement" => Ok(Self::AfterStatement),
            "after_transaction" => Ok(Self::AfterTransaction),
            "on_close" => Ok(Self::OnClose),
            other => Err(Error::Configuration(format!(
                "unknown connection release mode '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ConnectionReleaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AfterStatement => write!(f, "after_statement"),
            Self::AfterTransaction => write!(f, "after_transaction"),
            Self::OnClose => write!(f, "on_close"),
        }
    }
}

/// Configured release mode, where `Auto` defers to the transaction factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseModeSetting {
    #[default]
    Auto,
    AfterStatement,
    AfterTransaction,
    OnClose,
}

impl ReleaseModeSetting {
    /// Resolve against the transaction factory default and what the
    /// connection provider supports.
    pub fn resolve(
        self,
        factory_default: ConnectionReleaseMode,
        supports_aggressive_release: bool,
    ) -> ConnectionReleaseMode {
        let mode = match self {
            Self::Auto => factory_default,
            Self::AfterStatement => ConnectionReleaseMode::AfterStatement,
            Self::AfterTransaction => ConnectionReleaseMode::AfterTransaction,
            Self::OnClose => ConnectionReleaseMode::OnClose,
        };
        if mode == ConnectionReleaseMode::AfterStatement && !supports_aggressive_release {
            warn!(
                "overriding release mode as connection provider does not support 'after_statement'"
            );
            return ConnectionReleaseMode::AfterTransaction;
        }
        mode
    }
}

impl FromStr for ReleaseModeSetting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        Ok(match s.parse::<ConnectionReleaseMode>()? {
            ConnectionReleaseMode::AfterStatement => Self::AfterStatement,
            ConnectionReleaseMode::AfterTransaction => Self::AfterTransaction,
            ConnectionReleaseMode::OnClose => Self::OnClose,
        })
    }
}

/// Session-factory-wide settings consumed by the batcher and the connection
/// manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Statements queued before a batch is executed. `0` disables batching.
    pub batch_size: usize,

    /// Fetch size applied to query statements
    pub fetch_size: Option<u32>,

    pub scrollable_result_sets: bool,

    pub get_generated_keys: bool,

    /// Wrap result sets with a column-name lookup cache
    pub wrap_result_sets: bool,

    pub release_mode: ReleaseModeSetting,

    pub statistics_enabled: bool,

    pub comments_enabled: bool,

    /// Echo every statement to stdout
    pub show_sql: bool,

    pub format_sql: bool,

    pub auto_close_session: bool,

    pub flush_before_completion: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_size: 0,
            fetch_size: None,
            scrollable_result_sets: true,
            get_generated_keys: false,
            wrap_result_sets: false,
            release_mode: ReleaseModeSetting::Auto,
            statistics_enabled: false,
            comments_enabled: false,
            show_sql: false,
            format_sql: false,
            auto_close_session: false,
            flush_before_completion: false,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn fetch_size(mut self, rows: u32) -> Self {
        self.fetch_size = Some(rows);
        self
    }

    pub fn scrollable_result_sets(mut self, enabled: bool) -> Self {
        self.scrollable_result_sets = enabled;
        self
    }

    pub fn get_generated_keys(mut self, enabled: bool) -> Self {
        self.get_generated_keys = enabled;
        self
    }

    pub fn wrap_result_sets(mut self, enabled: bool) -> Self {
        self.wrap_result_sets = enabled;
        self
    }

    pub fn release_mode(mut self, mode: ReleaseModeSetting) -> Self {
        self.release_mode = mode;
        self
    }

    pub fn statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    pub fn comments(mut self, enabled: bool) -> Self {
        self.comments_enabled = enabled;
        self
    }

    pub fn show_sql(mut self, enabled: bool) -> Self {
        self.show_sql = enabled;
        self
    }

    pub fn format_sql(mut self, enabled: bool) -> Self {
        self.format_sql = enabled;
        self
    }

    pub fn auto_close_session(mut self, enabled: bool) -> Self {
        self.auto_close_session = enabled;
        self
    }

    pub fn flush_before_completion(mut self, enabled: bool) -> Self {
        self.flush_before_completion = enabled;
        self
    }

    pub fn is_batching(&self) -> bool {
        self.batch_size > 0
    }

    /// Build from a flat property map.
    ///
    /// ```
    /// # use std::collections::HashMap;
    /// # use session_jdbc::Settings;
    /// let mut props = HashMap::new();
    /// props.insert("jdbc.batch_size".to_string(), "20".to_string());
    /// props.insert("connection.release_mode".to_string(), "after_transaction".to_string());
    /// let settings = Settings::from_properties(&props).unwrap();
    /// assert_eq!(settings.batch_size, 20);
    /// ```
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let mut settings = Self::default();
        for (key, value) in props {
            let value = value.trim();
            match key.as_str() {
                "jdbc.batch_size" => settings.batch_size = parse_number(key, value)?,
                "jdbc.fetch_size" => {
                    let rows: u32 = parse_number(key, value)?;
                    settings.fetch_size = (rows > 0).then_some(rows);
                }
                "jdbc.use_scrollable_resultset" => {
                    settings.scrollable_result_sets = parse_flag(key, value)?
                }
                "jdbc.use_get_generated_keys" => {
                    settings.get_generated_keys = parse_flag(key, value)?
                }
                "jdbc.wrap_result_sets" => settings.wrap_result_sets = parse_flag(key, value)?,
                "connection.release_mode" => settings.release_mode = value.parse()?,
                "generate_statistics" => settings.statistics_enabled = parse_flag(key, value)?,
                "use_sql_comments" => settings.comments_enabled = parse_flag(key, value)?,
                "show_sql" => settings.show_sql = parse_flag(key, value)?,
                "format_sql" => settings.format_sql = parse_flag(key, value)?,
                "transaction.auto_close_session" => {
                    settings.auto_close_session = parse_flag(key, value)?
                }
                "transaction.flush_before_completion" => {
                    settings.flush_before_completion = parse_flag(key, value)?
                }
                _ => {}
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self =
            serde_json::from_str(json).map_err(|e| Error::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch_size == Some(0) {
            return Err(Error::Configuration("fetch_size must be > 0 when set".into()));
        }
        if self.format_sql && !self.show_sql {
            warn!("format_sql has no effect on stdout echo while show_sql is disabled");
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::Configuration(format!(
            "property '{}' expects a boolean, got '{}'",
            key, value
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::Configuration(format!("property '{}' expects a number, got '{}'", key, value))
    })
}

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use config::Config;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::wiki::pageinfo::PageInfoConfig;
use crate::wiki::quality::{Credentials, QualityConfig};

const ENV_PREFIX: &str = "WPQ";
const DEFAULT_CONFIG_FILE: &str = "wp_quality";
const DEFAULT_QUALITY_ENDPOINT: &str =
    "https://api.wikimedia.org/service/lw/inference/v1/models/{lang}wiki-{model}:predict";

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

/// Values shipped in sample configs that must be replaced before any request goes out.
const PLACEHOLDER_CONTACTS: &[&str] = &[
    "you@example.com",
    "your_email@example.com",
    "user@example.com",
    "YOUR_EMAIL",
];

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("contact email is not set (WPQ_CONTACT_EMAIL)")]
    MissingContact,

    #[error("contact email {0:?} is a placeholder")]
    PlaceholderContact(String),

    #[error("contact email {0:?} is not an email address")]
    InvalidContact(String),

    #[error("access token is not set (WPQ_ACCESS_TOKEN)")]
    MissingToken,

    #[error("article title is empty")]
    EmptyTitle,

    #[error("revision id must be positive, got {0}")]
    InvalidRevision(u64),

    #[error("{field} must be a positive number, got {value}")]
    InvalidRate { field: &'static str, value: f64 },

    #[error("failed to load settings: {0}")]
    Load(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

/// Validated contact identifier sent with every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact(String);

impl Contact {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let email = raw.trim();
        if email.is_empty() {
            return Err(ConfigError::MissingContact);
        }
        if email.contains('<')
            || email.contains('>')
            || PLACEHOLDER_CONTACTS
                .iter()
                .any(|p| p.eq_ignore_ascii_case(email))
        {
            return Err(ConfigError::PlaceholderContact(email.to_string()));
        }
        if !EMAIL_RE.is_match(email) {
            return Err(ConfigError::InvalidContact(email.to_string()));
        }
        Ok(Contact(email.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// User-Agent value: `<crate>/<version> (<email>; <project>)`.
    pub fn user_agent(&self, project: &str) -> String {
        format!(
            "{}/{} ({}; {})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.0,
            project
        )
    }
}

/// Everything loaded from defaults, the optional TOML file and `WPQ_*` variables.
#[derive(Clone, Deserialize)]
pub struct Settings {
    pub contact_email: String,
    pub access_token: String,
    pub project: String,
    pub wiki_language: String,
    pub pageinfo_endpoint: String,
    /// `{lang}` is replaced with `wiki_language` and `{model}` with `model_name`,
    /// so the default resolves to the `enwiki-articlequality` model.
    pub quality_endpoint: String,
    /// Key the prediction sits under in the response body.
    pub model_name: String,
    pub pageinfo_requests_per_second: f64,
    pub quality_requests_per_hour: f64,
    pub assumed_latency_ms: u64,
    #[serde(default)]
    pub pageinfo_delay_ms: Option<u64>,
    #[serde(default)]
    pub quality_delay_ms: Option<u64>,
    pub roster_path: PathBuf,
    pub population_path: PathBuf,
    pub output_path: PathBuf,
    pub failures_path: PathBuf,
    pub checkpoint_path: PathBuf,
}

// Keeps the bearer token out of logs.
impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("contact_email", &self.contact_email)
            .field("access_token", &if self.access_token.is_empty() { "" } else { "***" })
            .field("wiki_language", &self.wiki_language)
            .field("model_name", &self.model_name)
            .field("pageinfo_endpoint", &self.pageinfo_endpoint)
            .field("quality_endpoint", &self.quality_endpoint)
            .field("roster_path", &self.roster_path)
            .field("population_path", &self.population_path)
            .field("output_path", &self.output_path)
            .field("failures_path", &self.failures_path)
            .field("checkpoint_path", &self.checkpoint_path)
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Load settings. An explicit `file` must exist; otherwise `wp_quality.toml`
    /// in the working directory is read if present.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("contact_email", "")?
            .set_default("access_token", "")?
            .set_default("project", "politician article quality survey")?
            .set_default("wiki_language", "en")?
            .set_default("pageinfo_endpoint", "https://en.wikipedia.org/w/api.php")?
            .set_default(
                "quality_endpoint",
                DEFAULT_QUALITY_ENDPOINT,
            )?
            .set_default("model_name", "articlequality")?
            .set_default("pageinfo_requests_per_second", 100.0)?
            .set_default("quality_requests_per_hour", 5000.0)?
            .set_default("assumed_latency_ms", 2_i64)?
            .set_default("roster_path", "data/politicians_by_country.csv")?
            .set_default("population_path", "data/population_by_country.csv")?
            .set_default("output_path", "data/wp_politicians_by_country.csv")?
            .set_default("failures_path", "data/wp_failures.csv")?
            .set_default("checkpoint_path", "data/checkpoint.sqlite")?;

        let builder = match file {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn contact(&self) -> Result<Contact, ConfigError> {
        Contact::parse(&self.contact_email)
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        Credentials::new(self.contact()?, &self.access_token)
    }

    pub fn pageinfo_config(&self) -> Result<PageInfoConfig, ConfigError> {
        let delay = match self.pageinfo_delay_ms {
            Some(ms) => Duration::from_millis(ms),
            None => throttle_delay(
                Duration::from_secs(1),
                self.pageinfo_requests_per_second,
                self.latency(),
                "pageinfo_requests_per_second",
            )?,
        };
        Ok(PageInfoConfig {
            endpoint: self.pageinfo_endpoint.clone(),
            contact: self.contact()?,
            project: self.project.clone(),
            delay,
        })
    }

    pub fn quality_config(&self) -> Result<QualityConfig, ConfigError> {
        let delay = match self.quality_delay_ms {
            Some(ms) => Duration::from_millis(ms),
            None => throttle_delay(
                Duration::from_secs(3600),
                self.quality_requests_per_hour,
                self.latency(),
                "quality_requests_per_hour",
            )?,
        };
        Ok(QualityConfig {
            endpoint: self
                .quality_endpoint
                .replace("{lang}", &self.wiki_language)
                .replace("{model}", &self.model_name),
            model: self.model_name.clone(),
            language: self.wiki_language.clone(),
            project: self.project.clone(),
            delay,
        })
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.assumed_latency_ms)
    }
}

/// Fixed wait between calls: one request slot of `period / requests`, minus the
/// time the request itself is assumed to take.
pub fn throttle_delay(
    period: Duration,
    requests: f64,
    latency: Duration,
    field: &'static str,
) -> Result<Duration, ConfigError> {
    if !requests.is_finite() || requests <= 0.0 {
        return Err(ConfigError::InvalidRate {
            field,
            value: requests,
        });
    }
    let slot = Duration::from_nanos((period.as_nanos() as f64 / requests).round() as u64);
    Ok(slot.saturating_sub(latency))
}

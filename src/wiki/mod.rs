//! Throttled clients for the two Wikimedia services the pipeline calls:
//! the MediaWiki action API (page info → latest revision id) and the
//! Lift Wing inference API (revision id → article-quality prediction).

pub mod pageinfo;
pub mod quality;

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::settings::ConfigError;

pub type RevisionId = u64;

/// Categorical prediction such as `Stub`, `Start`, `C`, `B`, `GA`, `FA`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct QualityLabel(String);

impl QualityLabel {
    pub fn new(label: impl Into<String>) -> Self {
        QualityLabel(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("no revision id for {title:?}")]
    NoRevision { title: String, raw: Option<Value> },

    #[error("no {model} score for revision {revision_id}")]
    NoScore {
        revision_id: RevisionId,
        model: String,
        raw: Option<Value>,
    },

    #[error("country {country:?} is not in the population hierarchy")]
    UnknownCountry { country: String },
}

impl FetchError {
    /// The response body that lacked the expected field, when there was one.
    pub fn raw_response(&self) -> Option<&Value> {
        match self {
            FetchError::NoRevision { raw, .. } | FetchError::NoScore { raw, .. } => raw.as_ref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Decode(err.to_string())
    }
}

impl From<ShapeError> for FetchError {
    fn from(err: ShapeError) -> Self {
        FetchError::Decode(err.to_string())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShapeError {
    #[error("{0} is not an object")]
    NotAnObject(&'static str),

    #[error("{0} is empty")]
    Empty(&'static str),

    #[error("{path} has {count} entries, expected exactly one")]
    Ambiguous { path: &'static str, count: usize },
}

/// Unwraps a mapping that holds exactly one entry under an opaque key
/// (page id, revision id) and returns that entry.
pub fn sole_entry<'a>(
    value: &'a Value,
    path: &'static str,
) -> Result<(&'a str, &'a Value), ShapeError> {
    let map: &Map<String, Value> = value.as_object().ok_or(ShapeError::NotAnObject(path))?;
    let mut entries = map.iter();
    match (entries.next(), map.len()) {
        (None, _) => Err(ShapeError::Empty(path)),
        (Some((key, inner)), 1) => Ok((key.as_str(), inner)),
        (Some(_), count) => Err(ShapeError::Ambiguous { path, count }),
    }
}

/// Fixed wait taken before every request.
#[derive(Debug, Clone)]
pub struct Throttle {
    delay: Duration,
}

impl Throttle {
    pub fn new(delay: Duration) -> Self {
        Throttle { delay }
    }

    pub fn wait(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }
}

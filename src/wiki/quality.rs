use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{FetchError, QualityLabel, RevisionId, Throttle};
use crate::settings::{ConfigError, Contact};

#[derive(Debug, Clone)]
pub struct QualityConfig {
    /// Full predict URL with the model already substituted.
    pub endpoint: String,
    pub model: String,
    pub language: String,
    pub project: String,
    pub delay: Duration,
}

/// Contact email plus bearer token for the inference API.
#[derive(Clone)]
pub struct Credentials {
    contact: Contact,
    token: String,
}

impl Credentials {
    pub fn new(contact: Contact, token: &str) -> Result<Self, ConfigError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        Ok(Credentials {
            contact,
            token: token.to_string(),
        })
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("contact", &self.contact)
            .field("token", &"***")
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    lang: &'a str,
    rev_id: RevisionId,
}

/// One predict request per revision id.
pub struct QualityClient {
    http: Client,
    config: QualityConfig,
    throttle: Throttle,
}

impl QualityClient {
    pub fn new(config: QualityConfig) -> Result<Self, FetchError> {
        let http = Client::builder().build()?;
        let throttle = Throttle::new(config.delay);
        Ok(QualityClient {
            http,
            config,
            throttle,
        })
    }

    pub fn fetch_quality(
        &self,
        revision_id: RevisionId,
        credentials: &Credentials,
    ) -> Result<QualityLabel, FetchError> {
        if revision_id == 0 {
            return Err(ConfigError::InvalidRevision(revision_id).into());
        }

        self.throttle.wait();
        debug!(revision_id, model = %self.config.model, "Requesting quality score");
        let body: Value = self
            .http
            .post(&self.config.endpoint)
            .header(USER_AGENT, credentials.contact.user_agent(&self.config.project))
            .bearer_auth(&credentials.token)
            .json(&PredictRequest {
                lang: &self.config.language,
                rev_id: revision_id,
            })
            .send()?
            .error_for_status()?
            .json()?;

        parse_prediction(body, revision_id, &self.config.language, &self.config.model)
    }
}

/// Read `<lang>wiki.scores.<revision>.<model>.score.prediction`.
pub fn parse_prediction(
    body: Value,
    revision_id: RevisionId,
    language: &str,
    model: &str,
) -> Result<QualityLabel, FetchError> {
    let wiki = format!("{}wiki", language);
    let revision = revision_id.to_string();

    let prediction = body
        .get(wiki.as_str())
        .and_then(|w| w.get("scores"))
        .and_then(|s| s.get(revision.as_str()))
        .and_then(|r| r.get(model))
        .and_then(|m| m.get("score"))
        .and_then(|s| s.get("prediction"))
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(str::to_owned);

    match prediction {
        Some(label) => Ok(QualityLabel::new(label)),
        None => Err(FetchError::NoScore {
            revision_id,
            model: model.to_string(),
            raw: Some(body),
        }),
    }
}

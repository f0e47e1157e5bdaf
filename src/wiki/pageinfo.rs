use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use serde_json::Value;
use tracing::debug;

use super::{sole_entry, FetchError, RevisionId, Throttle};
use crate::settings::{ConfigError, Contact};

const INFO_PROPS: &str = "talkid|url|watched|watchers";

/// Holds a parsed `Contact`, so a client cannot be built without one.
#[derive(Debug, Clone)]
pub struct PageInfoConfig {
    pub endpoint: String,
    pub contact: Contact,
    pub project: String,
    pub delay: Duration,
}

impl PageInfoConfig {
    pub fn new(
        endpoint: impl Into<String>,
        contact_email: &str,
        project: impl Into<String>,
        delay: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(PageInfoConfig {
            endpoint: endpoint.into(),
            contact: Contact::parse(contact_email)?,
            project: project.into(),
            delay,
        })
    }

    pub fn user_agent(&self) -> String {
        self.contact.user_agent(&self.project)
    }
}

/// One `action=query&prop=info` request per title.
pub struct PageInfoClient {
    http: Client,
    config: PageInfoConfig,
    user_agent: String,
    throttle: Throttle,
}

impl PageInfoClient {
    pub fn new(config: PageInfoConfig) -> Result<Self, FetchError> {
        let http = Client::builder().build()?;
        let throttle = Throttle::new(config.delay);
        let user_agent = config.user_agent();
        Ok(PageInfoClient {
            http,
            config,
            user_agent,
            throttle,
        })
    }

    pub fn fetch_revision_id(&self, title: &str) -> Result<RevisionId, FetchError> {
        if title.trim().is_empty() {
            return Err(ConfigError::EmptyTitle.into());
        }

        self.throttle.wait();
        debug!(title, endpoint = %self.config.endpoint, "Requesting page info");
        let body: Value = self
            .http
            .get(&self.config.endpoint)
            .header(USER_AGENT, &self.user_agent)
            .query(&request_params(title))
            .send()?
            .error_for_status()?
            .json()?;

        parse_revision_id(title, body)
    }
}

/// Query string for a single title. Built fresh for every call.
fn request_params(title: &str) -> [(&'static str, &str); 5] {
    [
        ("action", "query"),
        ("format", "json"),
        ("titles", title),
        ("prop", "info"),
        ("inprop", INFO_PROPS),
    ]
}

/// Pull `lastrevid` out of `query.pages.<pageid>`. Missing pages come back
/// under page id `-1` with a `missing` marker and no `lastrevid`.
pub fn parse_revision_id(title: &str, body: Value) -> Result<RevisionId, FetchError> {
    if body.get("query").and_then(|q| q.get("pages")).is_none() {
        return Err(FetchError::NoRevision {
            title: title.to_string(),
            raw: Some(body),
        });
    }

    let (_page_id, page) = sole_entry(&body["query"]["pages"], "query.pages")?;
    let revision = page
        .get("lastrevid")
        .and_then(Value::as_u64)
        .filter(|id| *id > 0);

    match revision {
        Some(id) => Ok(id),
        None => Err(FetchError::NoRevision {
            title: title.to_string(),
            raw: Some(page.clone()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    // nothing listens on the discard port
    const UNROUTABLE: &str = "http://127.0.0.1:9/w/api.php";

    fn client(delay: Duration) -> PageInfoClient {
        let config = PageInfoConfig::new(UNROUTABLE, "ada@uni.edu", "test", delay).unwrap();
        PageInfoClient::new(config).unwrap()
    }

    fn fixture(name: &str) -> Value {
        let raw = std::fs::read_to_string(format!("tests/fixtures/{}.json", name)).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn existing_page_yields_last_revision() {
        let body = fixture("pageinfo_found");
        assert_eq!(
            parse_revision_id("Abdul Rashid Dostum", body).unwrap(),
            1246851111
        );
    }

    #[test]
    fn missing_page_is_no_revision() {
        let body = fixture("pageinfo_missing");
        let err = parse_revision_id("Nobody In Particular", body).unwrap_err();
        match err {
            FetchError::NoRevision { title, raw } => {
                assert_eq!(title, "Nobody In Particular");
                assert_eq!(raw.unwrap()["missing"], "");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn api_error_body_is_no_revision() {
        let body = json!({"error": {"code": "badvalue", "info": "Unrecognized value"}});
        assert!(matches!(
            parse_revision_id("X", body),
            Err(FetchError::NoRevision { .. })
        ));
    }

    #[test]
    fn several_pages_is_a_decode_error() {
        let body = json!({"query": {"pages": {"1": {"lastrevid": 5}, "2": {"lastrevid": 6}}}});
        assert!(matches!(
            parse_revision_id("X", body),
            Err(FetchError::Decode(_))
        ));
    }

    #[test]
    fn empty_title_fails_before_request() {
        assert!(matches!(
            client(Duration::ZERO).fetch_revision_id("  "),
            Err(FetchError::Config(ConfigError::EmptyTitle))
        ));
    }

    #[test]
    fn config_requires_real_contact() {
        for email in ["", "<your email here>", "you@example.com", "not an email"] {
            assert!(
                PageInfoConfig::new(UNROUTABLE, email, "test", Duration::ZERO).is_err(),
                "{email:?} accepted"
            );
        }
        let config = PageInfoConfig::new(UNROUTABLE, "ada@uni.edu", "survey", Duration::ZERO).unwrap();
        assert!(config.user_agent().ends_with("(ada@uni.edu; survey)"));
    }

    #[test]
    fn failed_request_still_waits_for_throttle() {
        let delay = Duration::from_millis(50);
        let start = Instant::now();
        let result = client(delay).fetch_revision_id("Jane Doe");
        assert!(start.elapsed() >= delay);
        assert!(matches!(result, Err(FetchError::Transport(_))), "{result:?}");
    }

    #[test]
    fn params_carry_title() {
        let params = request_params("Jane Doe");
        assert!(params.contains(&("titles", "Jane Doe")));
        assert!(params.contains(&("prop", "info")));
    }
}

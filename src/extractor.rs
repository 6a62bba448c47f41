use std::{sync::OnceLock, time::Duration};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    auth::{Credentials, TokenProvider},
    common::{Error, Result},
    config::Config,
};

/// Largest page the intra API serves.
pub const PAGE_SIZE: u32 = 100;

/// The API throttles clients that go faster than about one request a second.
/// Every request after the first in a walk is preceded by this pause.
pub const REQUEST_PAUSE: Duration = Duration::from_secs(1);

/// Ordered key/value pairs, used for both path placeholders and query strings.
///
/// Setting a key twice replaces the earlier value in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key.into(), value.to_string());
        self
    }

    /// Like [`Params::with`], but a `None` leaves the params untouched.
    pub fn with_opt<V: ToString>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn set(&mut self, key: String, value: String) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }
}

/// One page of a walk over a list endpoint.
#[derive(Clone, Debug)]
pub struct PageRequest<'a> {
    pub endpoint: &'a str,
    pub query: &'a Params,
    pub page_number: u32,
    pub page_size: u32,
}

impl PageRequest<'_> {
    /// Paging parameters first, then the caller's. The caller may override the
    /// page size but never the page number.
    pub fn query_pairs(&self) -> Params {
        let mut pairs = Params::new()
            .with("page[number]", self.page_number)
            .with("page[size]", self.page_size);
        for (key, value) in self.query.iter() {
            if key != "page[number]" {
                pairs.set(key.to_string(), value.to_string());
            }
        }
        pairs
    }
}

/// Substitutes `{name}` placeholders in an endpoint template, e.g.
/// `users/{user_id}/projects_users`.
pub fn resolve_endpoint(template: &str, path_params: &Params) -> Result<String> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder = PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("bad hardcoded regex"));

    let mut missing = Vec::new();
    let resolved = placeholder.replace_all(template, |caps: &regex::Captures| {
        let name = &caps[1];
        match path_params.get(name) {
            Some(value) => value.to_string(),
            None => {
                missing.push(name.to_string());
                caps[0].to_string()
            }
        }
    });

    if !missing.is_empty() {
        return Err(Error::Config(format!(
            "endpoint {template} has no value for {}",
            missing.join(", ")
        )));
    }
    Ok(resolved.into_owned())
}

/// Reads the last page number out of a `Link` header, e.g.
/// `<https://api.intra.42.fr/v2/users?page=3&per_page=100>; rel="last"`.
pub fn last_page_from_link(link: &str) -> Option<u32> {
    static ENTRY: OnceLock<Regex> = OnceLock::new();
    static REL: OnceLock<Regex> = OnceLock::new();
    // the target runs up to '>', its parameters up to the next '<'
    let entry = ENTRY.get_or_init(|| Regex::new(r"<([^>]*)>([^<]*)").expect("bad hardcoded regex"));
    let rel = REL.get_or_init(|| {
        Regex::new(r#"(?i)\brel\s*=\s*(?:"([^"]*)"|([^\s;,]+))"#).expect("bad hardcoded regex")
    });

    entry.captures_iter(link).find_map(|caps| {
        let params = caps.get(2)?.as_str();
        let rels = rel.captures(params)?;
        let rels = rels.get(1).or_else(|| rels.get(2))?.as_str();
        if !rels.split_ascii_whitespace().any(|r| r.eq_ignore_ascii_case("last")) {
            return None;
        }
        page_from_target(caps.get(1)?.as_str())
    })
}

fn page_from_target(target: &str) -> Option<u32> {
    let (_, query) = target.split_once('?')?;
    let query = query.split('#').next().unwrap_or_default();
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "page" || key == "page[number]")
        .and_then(|(_, value)| value.parse().ok())
        .filter(|page| *page >= 1)
}

/// Collapses a one-record result to the record itself. The campus dataset is
/// consumed that way.
pub fn unwrap_singleton(mut records: Vec<Value>) -> Value {
    if records.len() == 1 {
        records.remove(0)
    } else {
        Value::Array(records)
    }
}

/// Authenticated, paced reader of the intra API's list endpoints.
pub struct Extractor {
    http_client: reqwest::Client,
    tokens: TokenProvider,
    base_url: Url,
    page_size: u32,
    pause: Duration,
}

impl Extractor {
    pub fn new(http_client: reqwest::Client, tokens: TokenProvider, base_url: Url) -> Self {
        Self {
            http_client,
            tokens,
            base_url,
            page_size: PAGE_SIZE,
            pause: REQUEST_PAUSE,
        }
    }

    /// Resolves credentials for the current stage and authenticates.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let credentials = Credentials::for_config(config).await?;
        let http_client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;
        let tokens = TokenProvider::new(http_client.clone(), credentials).await?;
        Ok(Self::new(http_client, tokens, config.base_request_url.clone()))
    }

    #[cfg(test)]
    pub(crate) fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Issues one GET and reads the page count from its `Link` header. A
    /// missing header or a header without a `last` relation means one page.
    pub async fn count_pages(&self, endpoint: &str, query: &Params) -> Result<u32> {
        let response = self.get(endpoint, query).await?;

        let Some(link) = response.headers().get(reqwest::header::LINK) else {
            warn!("no Link header on {}, assuming only one page", endpoint);
            return Ok(1);
        };
        let link = match link.to_str() {
            Ok(link) => link.to_string(),
            Err(_) => {
                warn!("Link header on {} is not visible ASCII, reading it lossily", endpoint);
                String::from_utf8_lossy(link.as_bytes()).into_owned()
            }
        };
        debug!("link header found: {}", link);

        match last_page_from_link(&link) {
            Some(last_page) => {
                info!("found {} pages on {}", last_page, endpoint);
                Ok(last_page)
            }
            None => {
                info!("no 'last' relation in Link header on {}, assuming single page", endpoint);
                Ok(1)
            }
        }
    }

    /// Walks every page of `template` (with `path_params` substituted) and
    /// returns all records in page order.
    ///
    /// The first request only reads the page count; its records are not
    /// reused. Any failure discards what was already read.
    pub async fn fetch_all(
        &self,
        template: &str,
        path_params: &Params,
        query: &Params,
    ) -> Result<Vec<Value>> {
        let endpoint = resolve_endpoint(template, path_params)?;

        let counting = PageRequest {
            endpoint: &endpoint,
            query,
            page_number: 1,
            page_size: self.page_size,
        };
        let total_pages = self.count_pages(&endpoint, &counting.query_pairs()).await?;

        let mut records = Vec::new();
        for page_number in 1..=total_pages {
            // one pause after the counting request, then one between consecutive pages
            self.wait().await;

            let page = PageRequest {
                page_number,
                ..counting.clone()
            };
            info!("extracting {}, page {}/{}", endpoint, page_number, total_pages);
            match self.get(&endpoint, &page.query_pairs()).await?.json::<Value>().await {
                Ok(Value::Array(items)) => records.extend(items),
                Ok(other) => {
                    return Err(self.malformed(
                        &endpoint,
                        format!("page {page_number} is not a JSON array but {}", kind(&other)),
                    ))
                }
                Err(e) => {
                    return Err(self.malformed(&endpoint, format!("page {page_number}: {e}")))
                }
            }
        }

        info!("extracted {} records from {}", records.len(), endpoint);
        Ok(records)
    }

    /// A single unpaginated GET, body returned as is.
    pub async fn fetch_one(&self, endpoint: &str, query: &Params) -> Result<Value> {
        self.get(endpoint, query)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| self.malformed(endpoint, e.to_string()))
    }

    async fn get(&self, endpoint: &str, query: &Params) -> Result<reqwest::Response> {
        let http_error = |status: Option<reqwest::StatusCode>, reason: String| {
            error!("GET {} failed: {}", endpoint, reason);
            Error::Http {
                endpoint: endpoint.to_string(),
                status,
                reason,
            }
        };

        let url = self
            .base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| http_error(None, format!("bad endpoint url: {e}")))?;
        let token = self.tokens.get_token().await?;

        let response = self
            .http_client
            .get(url)
            .bearer_auth(token)
            .query(&query.0)
            .send()
            .await
            .map_err(|e| http_error(None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(Some(status), body));
        }
        Ok(response)
    }

    fn malformed(&self, endpoint: &str, detail: String) -> Error {
        error!("malformed response from {}: {}", endpoint, detail);
        Error::MalformedResponse {
            origin: endpoint.to_string(),
            detail,
        }
    }

    async fn wait(&self) {
        tokio::time::sleep(self.pause).await;
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

use std::fmt;

use jiff::{Span, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    common::{Error, Result},
    config::Config,
    secrets::{SecretChain, LATEST},
};

#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

// the secret must never end up in logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url)
            .finish()
    }
}

impl Credentials {
    /// Plain variant: everything comes from the environment.
    pub fn from_config(config: &Config) -> Result<Credentials> {
        fn required(value: &Option<String>, key: &str) -> Result<String> {
            value
                .clone()
                .ok_or_else(|| Error::Config(format!("{key} must be set")))
        }
        Ok(Credentials {
            client_id: required(&config.client_id, "CLIENT_ID")?,
            client_secret: required(&config.client_secret, "CLIENT_SECRET")?,
            token_url: required(&config.token_url, "TOKEN_URL")?,
        })
    }

    /// Secret-store variant: every value goes through the resolver chain.
    pub async fn resolve(secrets: &SecretChain) -> Result<Credentials> {
        Ok(Credentials {
            client_id: secrets.get("CLIENT_ID", LATEST).await?,
            client_secret: secrets.get("CLIENT_SECRET", LATEST).await?,
            token_url: secrets.get("TOKEN_URL", LATEST).await?,
        })
    }

    /// Hosted runs read credentials through the secret chain, local runs
    /// straight from the environment.
    pub async fn for_config(config: &Config) -> Result<Credentials> {
        if config.stage.is_hosted() {
            let secrets = SecretChain::for_config(config).await;
            Credentials::resolve(&secrets).await
        } else {
            debug!("local stage, reading credentials from the environment");
            Credentials::from_config(config)
        }
    }
}

#[derive(Clone, Serialize)]
struct TokenRequestBody<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Clone, Deserialize)]
struct TokenResponseBody {
    access_token: String,
    expires_in: i64,
}

/// A bearer token and the instant it stops being valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    value: String,
    expires_at: Timestamp,
}

impl Token {
    pub fn new(value: String, expires_at: Timestamp) -> Self {
        Self { value, expires_at }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// No skew margin: a token is good right up to its expiry instant.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Owns one set of client credentials and hands out a valid bearer token,
/// refreshing lazily when the stored one has expired.
///
/// The lock is held for the whole refresh, so concurrent callers never start
/// a second token request.
pub struct TokenProvider {
    http_client: reqwest::Client,
    credentials: Credentials,
    token: Mutex<Option<Token>>,
}

impl TokenProvider {
    /// Fetches the first token up front; a provider that could not
    /// authenticate is never handed out.
    pub async fn new(http_client: reqwest::Client, credentials: Credentials) -> Result<Self> {
        info!("initializing token provider for {}", credentials.token_url);
        let provider = Self {
            http_client,
            credentials,
            token: Mutex::new(None),
        };
        provider.get_token().await?;
        Ok(provider)
    }

    pub async fn get_token(&self) -> Result<String> {
        let mut slot = self.token.lock().await;
        match slot.as_ref() {
            Some(token) if !token.is_expired_at(Timestamp::now()) => {
                return Ok(token.value.clone());
            }
            Some(_) => warn!("token expired, refreshing"),
            None => debug!("no token yet, fetching one"),
        }

        // on failure the previous token stays in the slot
        let token = self.refresh().await?;
        let value = token.value.clone();
        *slot = Some(token);
        Ok(value)
    }

    /// The token currently held, expired or not.
    #[cfg(test)]
    pub async fn current(&self) -> Option<Token> {
        self.token.lock().await.clone()
    }

    async fn refresh(&self) -> Result<Token> {
        let token_url = &self.credentials.token_url;
        let auth_error = |reason: String| {
            error!("token fetch from {} failed: {}", token_url, reason);
            Error::Auth {
                token_url: token_url.clone(),
                reason,
            }
        };

        let body = TokenRequestBody {
            grant_type: "client_credentials",
            client_id: &self.credentials.client_id,
            client_secret: &self.credentials.client_secret,
        };
        debug!("requesting new token from {}", token_url);
        let response = self
            .http_client
            .post(token_url)
            .form(&body)
            .send()
            .await
            .map_err(|e| auth_error(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| auth_error(e.to_string()))?;
        if !status.is_success() {
            return Err(auth_error(format!("status {status}, body={text}")));
        }

        let malformed = |detail: String| {
            error!("token response from {} is malformed: {}", token_url, detail);
            Error::MalformedResponse {
                origin: token_url.clone(),
                detail,
            }
        };
        let response = serde_json::from_str::<TokenResponseBody>(&text)
            .map_err(|e| malformed(format!("failed to deserialize token response body, error={e}")))?;

        let lifetime = Span::new()
            .try_seconds(response.expires_in)
            .map_err(|e| malformed(format!("expires_in={} is out of range: {e}", response.expires_in)))?;
        let expires_at = Timestamp::now()
            .checked_add(lifetime)
            .map_err(|e| malformed(format!("expires_in={} is out of range: {e}", response.expires_in)))?;

        info!(
            "fetched new token, expires in {} seconds",
            response.expires_in
        );
        Ok(Token::new(response.access_token, expires_at))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jiff::ToSpan;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn credentials(server: &MockServer) -> Credentials {
        Credentials {
            client_id: "u-s4t2af".into(),
            client_secret: "s-s4t2af".into(),
            token_url: format!("{}/oauth/token", server.uri()),
        }
    }

    fn token_response(token: &str, expires_in: i64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": token,
            "token_type": "bearer",
            "expires_in": expires_in,
            "scope": "public",
        }))
    }

    #[test]
    fn token_expiry_has_no_margin() {
        let now = Timestamp::now();
        let token = Token::new("abc".into(), now);
        assert!(token.is_expired_at(now));
        assert!(!token.is_expired_at(now - 1.second()));
    }

    #[test]
    fn debug_output_hides_secret() {
        let credentials = Credentials {
            client_id: "id".into(),
            client_secret: "hunter2".into(),
            token_url: "https://x/token".into(),
        };
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn sends_client_credentials_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=u-s4t2af"))
            .and(body_string_contains("client_secret=s-s4t2af"))
            .respond_with(token_response("abc", 7200))
            .expect(1)
            .mount(&server)
            .await;

        let provider = TokenProvider::new(reqwest::Client::new(), credentials(&server))
            .await
            .unwrap();
        assert_eq!(provider.get_token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn valid_token_is_reused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_response("abc", 7200))
            .expect(1)
            .mount(&server)
            .await;

        let provider = TokenProvider::new(reqwest::Client::new(), credentials(&server))
            .await
            .unwrap();
        assert_eq!(provider.get_token().await.unwrap(), "abc");
        assert_eq!(provider.get_token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn zero_lifetime_refreshes_on_next_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_response("abc", 0))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_response("def", 7200))
            .expect(1)
            .mount(&server)
            .await;

        let provider = TokenProvider::new(reqwest::Client::new(), credentials(&server))
            .await
            .unwrap();
        assert_eq!(provider.current().await.unwrap().value(), "abc");
        assert_eq!(provider.get_token().await.unwrap(), "def");
        assert_eq!(provider.get_token().await.unwrap(), "def");
    }

    #[tokio::test]
    async fn refreshes_once_after_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_response("abc", 1))
            .expect(2)
            .mount(&server)
            .await;

        let provider = TokenProvider::new(reqwest::Client::new(), credentials(&server))
            .await
            .unwrap();
        provider.get_token().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        provider.get_token().await.unwrap();
    }

    #[tokio::test]
    async fn construction_fails_when_first_fetch_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string(r#"{"error":"invalid_client"}"#))
            .mount(&server)
            .await;

        match TokenProvider::new(reqwest::Client::new(), credentials(&server)).await {
            Err(Error::Auth { token_url, reason }) => {
                assert!(token_url.ends_with("/oauth/token"));
                assert!(reason.contains("401"), "{reason}");
            }
            Err(other) => panic!("expected Auth, got {other:?}"),
            Ok(_) => panic!("expected Auth, got a provider"),
        }
    }

    #[tokio::test]
    async fn missing_access_token_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"expires_in": 7200})))
            .mount(&server)
            .await;

        let result = TokenProvider::new(reqwest::Client::new(), credentials(&server)).await;
        assert!(matches!(result, Err(Error::MalformedResponse { .. })));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_response("abc", 0))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_response("ghi", 7200))
            .mount(&server)
            .await;

        let provider = TokenProvider::new(reqwest::Client::new(), credentials(&server))
            .await
            .unwrap();
        let before = provider.current().await.unwrap();

        assert!(matches!(provider.get_token().await, Err(Error::Auth { .. })));
        assert_eq!(provider.current().await.unwrap(), before);

        // the next call starts over and succeeds
        assert_eq!(provider.get_token().await.unwrap(), "ghi");
    }

    #[tokio::test]
    async fn credentials_from_config_require_all_three() {
        let config = Config::from_lookup(|k| match k {
            "REQ_URL" => Some("http://localhost/".into()),
            "CLIENT_ID" => Some("id".into()),
            "TOKEN_URL" => Some("http://localhost/oauth/token".into()),
            _ => None,
        })
        .unwrap();
        match Credentials::from_config(&config) {
            Err(Error::Config(msg)) => assert!(msg.contains("CLIENT_SECRET")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_stage_reads_credentials_from_environment() {
        let config = Config::from_lookup(|k| match k {
            "STAGE" => Some("local".into()),
            "REQ_URL" => Some("http://localhost/".into()),
            "CLIENT_ID" => Some("id".into()),
            "CLIENT_SECRET" => Some("secret".into()),
            "TOKEN_URL" => Some("http://localhost/oauth/token".into()),
            _ => None,
        })
        .unwrap();
        let credentials = Credentials::for_config(&config).await.unwrap();
        assert_eq!(credentials.client_id, "id");
        assert_eq!(credentials.client_secret, "secret");
        assert_eq!(credentials.token_url, "http://localhost/oauth/token");
    }

    #[tokio::test]
    async fn local_stage_missing_secret_is_config_error() {
        let config = Config::from_lookup(|k| match k {
            "REQ_URL" => Some("http://localhost/".into()),
            "CLIENT_ID" => Some("id".into()),
            "TOKEN_URL" => Some("http://localhost/oauth/token".into()),
            _ => None,
        })
        .unwrap();
        assert!(matches!(
            Credentials::for_config(&config).await,
            Err(Error::Config(_))
        ));
    }
}

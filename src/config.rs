use std::path::PathBuf;

use tracing::debug;
use url::Url;

use crate::common::{Error, Result, Stage};

pub const DEFAULT_DATA_DIR: &str = "data";

/// Process-level settings, read from the environment after `.env` is loaded.
///
/// The client credentials are optional here: on a hosted stage they may come
/// from the remote secret store instead, see [`crate::secrets`].
#[derive(Clone, Debug)]
pub struct Config {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: Option<String>,
    pub base_request_url: Url,
    pub data_dir: PathBuf,
    pub secret_store_id: Option<String>,
    pub stage: Stage,
}

impl Config {
    pub fn load() -> Result<Config> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("loaded environment overrides from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `load` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base_request_url = non_empty("REQ_URL")
            .ok_or_else(|| Error::Config("REQ_URL must be set".into()))?;
        let base_request_url = parse_base_url(&base_request_url)?;

        Ok(Config {
            client_id: non_empty("CLIENT_ID"),
            client_secret: non_empty("CLIENT_SECRET"),
            token_url: non_empty("TOKEN_URL"),
            base_request_url,
            data_dir: non_empty("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            secret_store_id: non_empty("SECRET_STORE_ID"),
            stage: Stage::detect(&non_empty),
        })
    }
}

/// Endpoints are joined onto the base url, so it has to end in a slash or the
/// last path segment would be replaced.
fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url =
        Url::parse(raw).map_err(|e| Error::Config(format!("REQ_URL {raw:?} is not a url: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(Error::Config(format!("REQ_URL {raw:?} cannot be a base url")));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use aws_config::{meta::region::RegionProviderChain, BehaviorVersion};
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use tracing::{debug, info, warn};

use crate::{
    common::{Error, Result},
    config::Config,
};

/// Version label meaning "whatever the store considers current".
pub const LATEST: &str = "latest";

/// One place a secret can live.
///
/// `resolve` returns `Ok(None)` when the secret is simply absent so the chain
/// can move on to the next location.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    fn location(&self, name: &str) -> String;

    async fn resolve(&self, name: &str, version: &str) -> Result<Option<String>>;
}

/// Values that came from the process configuration (`.env` or environment).
pub struct LocalResolver {
    values: HashMap<String, String>,
}

impl LocalResolver {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn from_config(config: &Config) -> Self {
        let values = [
            ("CLIENT_ID", &config.client_id),
            ("CLIENT_SECRET", &config.client_secret),
            ("TOKEN_URL", &config.token_url),
        ]
        .into_iter()
        .filter_map(|(k, v)| Some((k.to_string(), v.clone()?)))
        .collect();
        Self::new(values)
    }
}

#[async_trait]
impl SecretResolver for LocalResolver {
    fn location(&self, name: &str) -> String {
        format!("local configuration ({name})")
    }

    async fn resolve(&self, name: &str, _version: &str) -> Result<Option<String>> {
        Ok(self.values.get(name).cloned())
    }
}

/// AWS Secrets Manager, with every secret stored under `<prefix>/<name>`.
pub struct AwsSecretsResolver {
    client: aws_sdk_secretsmanager::Client,
    prefix: String,
}

impl AwsSecretsResolver {
    pub async fn from_env(prefix: &str) -> Self {
        let region = RegionProviderChain::default_provider().or_else("us-east-1");
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region)
            .load()
            .await;
        Self {
            client: aws_sdk_secretsmanager::Client::new(&sdk_config),
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    fn secret_id(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }
}

#[async_trait]
impl SecretResolver for AwsSecretsResolver {
    fn location(&self, name: &str) -> String {
        format!("aws secrets manager ({})", self.secret_id(name))
    }

    async fn resolve(&self, name: &str, version: &str) -> Result<Option<String>> {
        let request = self.client.get_secret_value().secret_id(self.secret_id(name));
        let request = match version {
            LATEST => request.version_stage("AWSCURRENT"),
            id => request.version_id(id),
        };
        match request.send().await {
            Ok(output) => Ok(output.secret_string().map(str::to_owned)),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                Ok(None)
            }
            Err(e) => Err(Error::SecretStore {
                location: self.location(name),
                reason: DisplayErrorContext(&e).to_string(),
            }),
        }
    }
}

/// Tries each resolver in order and remembers what it found for as long as the
/// chain lives.
#[derive(Clone)]
pub struct SecretChain {
    resolvers: Arc<Vec<Box<dyn SecretResolver>>>,
    cache: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl SecretChain {
    pub fn new(resolvers: Vec<Box<dyn SecretResolver>>) -> Self {
        Self {
            resolvers: Arc::new(resolvers),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Remote store first (hosted stage with a store id only), then the local
    /// configuration.
    pub async fn for_config(config: &Config) -> Self {
        let mut resolvers: Vec<Box<dyn SecretResolver>> = Vec::new();
        match (&config.secret_store_id, config.stage.is_hosted()) {
            (Some(store_id), true) => {
                info!("hosted stage detected, reading secrets from {}", store_id);
                resolvers.push(Box::new(AwsSecretsResolver::from_env(store_id).await));
            }
            (Some(_), false) => debug!("not hosted, ignoring SECRET_STORE_ID"),
            (None, _) => {}
        }
        resolvers.push(Box::new(LocalResolver::from_config(config)));
        Self::new(resolvers)
    }

    pub async fn get(&self, name: &str, version: &str) -> Result<String> {
        let key = (name.to_string(), version.to_string());
        if let Some(value) = self.cached(&key) {
            return Ok(value);
        }

        let mut checked = Vec::with_capacity(self.resolvers.len());
        for resolver in self.resolvers.iter() {
            let location = resolver.location(name);
            match resolver.resolve(name, version).await {
                Ok(Some(value)) => {
                    debug!("resolved secret {} from {}", name, location);
                    self.cache
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(key, value.clone());
                    return Ok(value);
                }
                Ok(None) => debug!("secret {} not in {}", name, location),
                Err(error) => warn!(%error, "skipping {} for secret {}", location, name),
            }
            checked.push(location);
        }

        warn!("secret {} not found in any of: {}", name, checked.join(", "));
        Err(Error::SecretNotFound {
            name: name.to_string(),
            checked,
        })
    }

    fn cached(&self, key: &(String, String)) -> Option<String> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }
}

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The token endpoint could not be reached or refused the credentials.
    #[error("token request to {token_url} failed: {reason}")]
    Auth { token_url: String, reason: String },

    /// A data endpoint answered with a non-2xx status, or never answered.
    #[error("GET {endpoint} failed: {}", describe_status(.status, .reason))]
    Http {
        endpoint: String,
        status: Option<StatusCode>,
        reason: String,
    },

    /// A secret store failed for a reason other than the secret being absent.
    #[error("secret store {location} failed: {reason}")]
    SecretStore { location: String, reason: String },

    #[error("secret {name} not found, checked: {}", .checked.join(", "))]
    SecretNotFound { name: String, checked: Vec<String> },

    /// A 2xx response whose body did not have the expected shape.
    #[error("malformed response from {origin}: {detail}")]
    MalformedResponse { origin: String, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn describe_status(status: &Option<StatusCode>, reason: &str) -> String {
    match status {
        Some(s) => format!("status {s}: {reason}"),
        None => reason.to_string(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    LOCAL,
    HOSTED,
}

impl From<String> for Stage {
    fn from(value: String) -> Self {
        match value.as_str() {
            "hosted" => Stage::HOSTED,
            "local" => Stage::LOCAL,
            _ => Stage::LOCAL,
        }
    }
}

impl Stage {
    /// Environment variables that only exist when running on AWS compute.
    const HOSTED_MARKERS: [&'static str; 3] = [
        "AWS_EXECUTION_ENV",
        "AWS_LAMBDA_FUNCTION_NAME",
        "ECS_CONTAINER_METADATA_URI_V4",
    ];

    /// Picks the stage from an explicit `STAGE` value, falling back to the
    /// hosting markers.
    pub fn detect(lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(stage) = lookup("STAGE") {
            return stage.into();
        }
        if Self::HOSTED_MARKERS.iter().any(|m| lookup(m).is_some()) {
            Stage::HOSTED
        } else {
            Stage::LOCAL
        }
    }

    pub fn is_hosted(self) -> bool {
        self == Stage::HOSTED
    }
}

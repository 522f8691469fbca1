#![deny(clippy::all, clippy::pedantic)]

use cachesync::config::{ConsistencySettings, LoadError};
use cachesync::consistency::{CheckError, HashChecker, endpoint};
use cachesync::error::TelemetryError;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Check(#[from] CheckError),
    #[error("no peer configured (use --host or CACHESYNC__CONSISTENCY__HOSTS)")]
    MissingHosts,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("peers disagree on the consistency hash")]
    Inconsistent,
}

pub struct Ctx {
    pub client: Client,
    pub checker: HashChecker,
    hosts: Vec<Url>,
}

impl Ctx {
    pub fn new(settings: &ConsistencySettings) -> Result<Self, CliError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.request_timeout)
            .build()?;
        let checker = HashChecker::new(settings.hosts.clone(), settings.request_timeout)?;
        Ok(Self {
            client,
            checker,
            hosts: settings.hosts.clone(),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("cachesync-cli/", env!("CARGO_PKG_VERSION"))
    }

    /// The explicit peer, else the first configured host.
    pub fn peer<'a>(&'a self, explicit: Option<&'a Url>) -> Result<&'a Url, CliError> {
        explicit.or(self.hosts.first()).ok_or(CliError::MissingHosts)
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        peer: &Url,
        segments: &[&str],
    ) -> Result<T, CliError> {
        let url = endpoint(peer, segments)?;
        let resp = self.client.request(method, url).send().await?;
        Self::handle(resp).await
    }

    async fn handle<T: DeserializeOwned>(resp: Response) -> Result<T, CliError> {
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            return Err(CliError::Server(format!("status {status} body {text}")));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| CliError::Server(format!("failed to parse body: {e}")))
    }
}

/// Epoch milliseconds, given either as an integer or as an RFC 3339 instant.
pub fn parse_instant(value: &str) -> Result<i64, CliError> {
    if let Ok(millis) = value.trim().parse::<i64>() {
        return Ok(millis);
    }
    let parsed = OffsetDateTime::parse(value.trim(), &Rfc3339)
        .map_err(|e| CliError::InvalidInput(format!("`{value}`: {e}")))?;
    i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000)
        .map_err(|e| CliError::InvalidInput(e.to_string()))
}

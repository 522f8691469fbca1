//! Cross-instance consistency check.
//!
//! Asks every peer for its consistency hash, takes the most common answer as
//! the reference, and sorts peers into synced, desynced and failed.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const SOURCE: &str = "cachesync::consistency";

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("{url} answered with a non-numeric hash `{body}`")]
    Body { url: String, body: String },
    #[error("{0} cannot be used as a base URL")]
    BaseUrl(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HashReport {
    /// Most common hash among peers that answered.
    pub majority: Option<u32>,
    pub synced: BTreeMap<String, u32>,
    pub desynced: BTreeMap<String, u32>,
    pub failed: BTreeMap<String, String>,
}

impl HashReport {
    pub fn is_consistent(&self) -> bool {
        self.desynced.is_empty() && self.failed.is_empty()
    }
}

/// Most frequent hash. Ties go to the hash seen first.
pub fn most_common_hash(hashes: impl IntoIterator<Item = u32>) -> Option<u32> {
    let mut counts: HashMap<u32, (usize, usize)> = HashMap::new();
    for (position, hash) in hashes.into_iter().enumerate() {
        counts.entry(hash).or_insert((0, position)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(hash, _)| hash)
}

/// Classify peer answers, given in peer order, against their majority.
pub fn classify(answers: Vec<(String, Result<u32, String>)>) -> HashReport {
    let majority = most_common_hash(
        answers
            .iter()
            .filter_map(|(_, answer)| answer.as_ref().ok().copied()),
    );
    let mut report = HashReport {
        majority,
        ..HashReport::default()
    };
    for (peer, answer) in answers {
        match answer {
            Ok(hash) if Some(hash) == majority => {
                report.synced.insert(peer, hash);
            }
            Ok(hash) => {
                report.desynced.insert(peer, hash);
            }
            Err(reason) => {
                report.failed.insert(peer, reason);
            }
        }
    }
    report
}

/// Path segments of the hash endpoint for all datasets or one dataset.
pub fn hash_path(dataset: Option<&str>) -> Vec<&str> {
    let mut segments = vec!["info", "hash"];
    if let Some(dataset) = dataset {
        segments.push(dataset);
    }
    segments
}

/// `base` with `segments` appended as percent-encoded path segments.
pub fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, CheckError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| CheckError::BaseUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Queries the hash endpoint of a fixed set of peers.
pub struct HashChecker {
    client: reqwest::Client,
    hosts: Vec<Url>,
}

impl HashChecker {
    pub fn new(hosts: Vec<Url>, timeout: Duration) -> Result<Self, CheckError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CheckError::Client)?;
        Ok(Self { client, hosts })
    }

    pub fn hosts(&self) -> &[Url] {
        &self.hosts
    }

    /// Hash of every dataset, or of `dataset` only, from every peer.
    pub async fn check(&self, dataset: Option<&str>) -> HashReport {
        let segments = hash_path(dataset);
        let answers = join_all(self.hosts.iter().map(|host| {
            let segments = segments.clone();
            async move {
                let answer = self
                    .fetch(host, &segments)
                    .await
                    .map_err(|err| err.to_string());
                (host.to_string(), answer)
            }
        }))
        .await;

        let report = classify(answers);
        if report.is_consistent() {
            debug!(
                source_module = SOURCE,
                peers = report.synced.len(),
                majority = ?report.majority,
                "Peers agree"
            );
        } else {
            warn!(
                source_module = SOURCE,
                majority = ?report.majority,
                desynced = report.desynced.len(),
                failed = report.failed.len(),
                "Peers disagree"
            );
        }
        report
    }

    async fn fetch(&self, host: &Url, segments: &[&str]) -> Result<u32, CheckError> {
        let url = endpoint(host, segments)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| CheckError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await.map_err(|source| CheckError::Request {
            url: url.to_string(),
            source,
        })?;
        body.trim().parse().map_err(|_| CheckError::Body {
            url: url.to_string(),
            body,
        })
    }
}

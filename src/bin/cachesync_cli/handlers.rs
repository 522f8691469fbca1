#![deny(clippy::all, clippy::pedantic)]

use cachesync::cache::RefreshReport;
use cachesync::changelog::ChangeLogRecord;
use cachesync::consistency::HashReport;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::client::{CliError, Ctx, parse_instant};
use crate::print::print_json;

pub async fn check_hash(ctx: &Ctx, dataset: Option<&str>) -> Result<(), CliError> {
    let report = compare(ctx, dataset).await?;
    print_json(&report)?;
    if report.is_consistent() {
        Ok(())
    } else {
        Err(CliError::Inconsistent)
    }
}

pub(crate) async fn compare(ctx: &Ctx, dataset: Option<&str>) -> Result<HashReport, CliError> {
    if ctx.checker.hosts().is_empty() {
        return Err(CliError::MissingHosts);
    }
    Ok(ctx.checker.check(dataset).await)
}

pub async fn changes(
    ctx: &Ctx,
    peer: Option<&Url>,
    start: &str,
    end: &str,
) -> Result<(), CliError> {
    let records = fetch_changes(ctx, peer, parse_instant(start)?, parse_instant(end)?).await?;
    print_json(&records)
}

pub(crate) async fn fetch_changes(
    ctx: &Ctx,
    peer: Option<&Url>,
    start: i64,
    end: i64,
) -> Result<Vec<ChangeLogRecord>, CliError> {
    if end < start {
        return Err(CliError::InvalidInput(format!(
            "window end {end} is before start {start}"
        )));
    }
    let peer = ctx.peer(peer)?;
    let (start, end) = (start.to_string(), end.to_string());
    ctx.request(Method::GET, peer, &["changed-keys", &start, &end])
        .await
}

#[derive(Debug, Deserialize)]
struct RefreshAll {
    not_refreshed: Vec<String>,
}

pub async fn refresh(ctx: &Ctx, peer: Option<&Url>, dataset: Option<&str>) -> Result<(), CliError> {
    let peer = ctx.peer(peer)?;
    match dataset {
        Some(dataset) => {
            let report: RefreshReport = ctx
                .request(Method::POST, peer, &["info", "refresh", dataset])
                .await?;
            print_json(&report)
        }
        None => {
            let result: RefreshAll = ctx
                .request(Method::POST, peer, &["info", "refresh"])
                .await?;
            print_json(&json!({ "not_refreshed": result.not_refreshed }))
        }
    }
}

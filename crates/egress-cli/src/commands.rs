//! Command implementations for the CLI.

use std::fs;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use egress_client::{CallerHeaders, Client, ExecutionOutcome};
use egress_common::{ConnectionSettings, QueryDescriptor, RenderMode};
use tokio_util::sync::CancellationToken;

use crate::display::{display_outcome, display_request};

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn parse_settings(contents: &str) -> Result<ConnectionSettings> {
    toml::from_str(contents).context("invalid connection settings")
}

fn parse_query(contents: &str) -> Result<QueryDescriptor> {
    toml::from_str(contents).context("invalid query descriptor")
}

fn load(settings_path: &Path, query_path: &Path) -> Result<(ConnectionSettings, QueryDescriptor)> {
    let settings = parse_settings(&read_file(settings_path)?)
        .with_context(|| settings_path.display().to_string())?;
    let query =
        parse_query(&read_file(query_path)?).with_context(|| query_path.display().to_string())?;
    Ok((settings, query))
}

/// Prints the request `query` would produce, with secrets redacted.
pub async fn preview(settings_path: &Path, query_path: &Path) -> Result<ExitCode> {
    let (settings, query) = load(settings_path, query_path)?;
    let client = Client::new(settings)?;
    let request = client
        .prepare(&query, &CallerHeaders::new(), RenderMode::Redacted)
        .await?;

    display_request(&request);
    Ok(ExitCode::SUCCESS)
}

/// Executes `query` and prints the outcome. Ctrl-C cancels the request.
pub async fn run(
    settings_path: &Path,
    query_path: &Path,
    headers: Vec<(String, String)>,
) -> Result<ExitCode> {
    let (settings, query) = load(settings_path, query_path)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let outcome = execute(settings, &query, headers.into_iter().collect(), &cancel).await?;
    display_outcome(&outcome);

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn execute(
    settings: ConnectionSettings,
    query: &QueryDescriptor,
    caller: CallerHeaders,
    cancel: &CancellationToken,
) -> Result<ExecutionOutcome> {
    let client = Client::new(settings)?;
    if client.is_mock() {
        tracing::info!("connection is flagged as mock");
    }
    Ok(client.query(query, &caller, cancel).await)
}

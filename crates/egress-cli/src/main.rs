//! Egress CLI
//!
//! Previews and executes a single request for a connection described in TOML.
//! `preview` never sends anything and prints secrets as `xxxxxxxx`.

mod commands;
mod display;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the assembled request with secrets redacted
    Preview {
        /// Connection settings (TOML)
        #[arg(long)]
        settings: PathBuf,

        /// Query descriptor (TOML)
        #[arg(long)]
        query: PathBuf,
    },
    /// Execute the request and print status, duration and payload
    Run {
        /// Connection settings (TOML)
        #[arg(long)]
        settings: PathBuf,

        /// Query descriptor (TOML)
        #[arg(long)]
        query: PathBuf,

        /// Caller header forwarded with the request, as NAME=VALUE
        #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

/// Initializes structured logging on stderr.
///
/// `EGRESS_LOG_FORMAT=json` switches to JSON lines; anything else is the
/// human-readable format. The level comes from `RUST_LOG`.
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let format = std::env::var("EGRESS_LOG_FORMAT")
        .unwrap_or_else(|_| "pretty".to_string())
        .to_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("egress=warn,egress_client=warn"));

    match format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let result = match args.command {
        Command::Preview { settings, query } => commands::preview(&settings, &query).await,
        Command::Run {
            settings,
            query,
            headers,
        } => commands::run(&settings, &query, headers).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".bright_red());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Trace=a=b").unwrap(),
            ("X-Trace".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_header("X-Empty=").unwrap(),
            ("X-Empty".to_string(), String::new())
        );
        assert!(parse_header("no-separator").is_err());
        assert!(parse_header("=value").is_err());
    }

    #[test]
    fn test_run_collects_repeated_headers() {
        let args = Args::try_parse_from([
            "egress",
            "run",
            "--settings",
            "s.toml",
            "--query",
            "q.toml",
            "--header",
            "Authorization=Bearer t",
            "--header",
            "X-ID-Token=id",
        ])
        .unwrap();

        let Command::Run { headers, .. } = args.command else {
            unreachable!("parsed a different subcommand");
        };
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1], ("X-ID-Token".to_string(), "id".to_string()));
    }
}

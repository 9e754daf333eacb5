//! CLI entry point for the cardwatch tool.

use std::io::Read;
use std::process::ExitCode;

use anyhow::{Context, Result};
use cardwatch_core::{CardwatchService, CookieVault, Credentials, ServiceError};
use clap::Parser;
use tracing::{debug, info};

mod cli;

use cli::{Args, Command, CookiesAction};

/// Exit code signalling the caller should run a fresh interactive login.
const EXIT_SESSION_EXPIRED: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let vault = CookieVault::open_default().context("cannot locate cookie store")?;
    let bootstrap = std::env::var("CARDWATCH_INITIAL_COOKIES").ok();
    let service = CardwatchService::new(&args.base_url, vault)
        .context("service construction failed")?
        .with_bootstrap(bootstrap);

    let outcome = match args.command {
        Command::Balance => service.get_balances().await.map(|report| print_json(&report)),
        Command::Transactions { begin, end } => service
            .get_transactions(begin.as_deref(), end.as_deref())
            .await
            .map(|report| print_json(&report)),
        Command::Login { username } => {
            let password = std::env::var("CARDWATCH_PASSWORD")
                .context("set CARDWATCH_PASSWORD for login")?;
            info!(username = %username, "starting interactive login; approve the push when prompted");
            service
                .login(&Credentials::new(username, password))
                .await
                .map(|report| print_json(&report))
        }
        Command::Cookies { action } => return run_cookies(&service, &action).map(|()| ExitCode::SUCCESS),
    };

    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(error) => {
            println!("{}", error.wire_body());
            if error.is_session_expired() {
                Ok(ExitCode::from(EXIT_SESSION_EXPIRED))
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn print_json(report: &impl serde::Serialize) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{json}"),
        Err(error) => println!("{{\"error\": \"serialization failed: {error}\"}}"),
    }
}

fn run_cookies(service: &CardwatchService, action: &CookiesAction) -> Result<()> {
    match action {
        CookiesAction::Import { source } => {
            let blob = if source == "-" {
                let mut buffer = String::new();
                std::io::stdin()
                    .read_to_string(&mut buffer)
                    .context("cannot read bootstrap blob from stdin")?;
                buffer
            } else {
                std::fs::read_to_string(source)
                    .with_context(|| format!("cannot read bootstrap blob from '{source}'"))?
            };

            let count = service
                .import_cookies(blob.trim())
                .map_err(report_service_error)?;
            info!(cookies = count, "bootstrap cookies imported");
            println!("{}", serde_json::json!({ "status": "success", "cookies_count": count }));
            Ok(())
        }
        CookiesAction::Clear => {
            let removed = service.clear_cookies().map_err(report_service_error)?;
            println!("{}", serde_json::json!({ "status": "success", "removed": removed }));
            Ok(())
        }
        CookiesAction::Path => {
            println!("{}", service.target_cookie_path().display());
            Ok(())
        }
    }
}

fn report_service_error(error: ServiceError) -> anyhow::Error {
    anyhow::anyhow!("{error}")
}

//! Membrane CLI.
//!
//! ```text
//! membrane demo              run every layer end to end, print JSON
//! membrane verify <file|->   check a sealed envelope; exit 1 on violation
//! membrane domains           print the domain registry
//! ```
//!
//! Logs go to stderr (filter via `RUST_LOG`), so stdout stays clean JSON.

mod demo;

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::{env, fs};

use anyhow::{Context, Result, bail};
use membrane_config::MembraneConfig;
use membrane_core::SealedProjection;
use membrane_types::registry;
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const USAGE: &str = "usage: membrane <demo | verify <file|-> | domains>";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Demo,
    Verify(Option<PathBuf>),
    Domains,
    Help,
}

fn parse_args<I>(mut args: I) -> Result<Command>
where
    I: Iterator<Item = String>,
{
    let command = match args.next().as_deref() {
        None | Some("help" | "-h" | "--help") => Command::Help,
        Some("demo") => Command::Demo,
        Some("domains") => Command::Domains,
        Some("verify") => match args.next().as_deref() {
            None => bail!("verify needs a file path or '-'\n{USAGE}"),
            Some("-") => Command::Verify(None),
            Some(path) => Command::Verify(Some(PathBuf::from(path))),
        },
        Some(other) => bail!("unknown command '{other}'\n{USAGE}"),
    };
    if let Some(extra) = args.next() {
        bail!("unexpected argument '{extra}'\n{USAGE}");
    }
    Ok(command)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_input(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
        }
        None => {
            let mut input = String::new();
            io::stdin()
                .read_to_string(&mut input)
                .context("failed to read stdin")?;
            Ok(input)
        }
    }
}

/// `(report, integrity_ok)` for one serialized envelope.
fn verify_envelope(input: &str) -> Result<(Value, bool)> {
    let envelope: SealedProjection =
        serde_json::from_str(input).context("input is not a sealed envelope")?;
    let ok = envelope.verify();
    let report = match envelope.unseal() {
        Ok(projection) => json!({
            "integrity_ok": true,
            "domain": projection.key().as_str(),
            "epoch": envelope.epoch().value(),
            "signature": envelope.signature(),
        }),
        Err(violation) => {
            tracing::warn!("{violation}");
            json!({
                "integrity_ok": false,
                "epoch": envelope.epoch().value(),
                "error": violation.to_string(),
            })
        }
    };
    Ok((report, ok))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();

    match parse_args(env::args().skip(1))? {
        Command::Help => {
            println!("{USAGE}");
        }
        Command::Domains => {
            print_json(&serde_json::to_value(registry())?)?;
        }
        Command::Demo => {
            let config = MembraneConfig::load();
            tracing::debug!(?config, "Loaded configuration");
            print_json(&demo::run(&config).await?)?;
        }
        Command::Verify(path) => {
            let (report, ok) = verify_envelope(&read_input(path.as_ref())?)?;
            print_json(&report)?;
            if !ok {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

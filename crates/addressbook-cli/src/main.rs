//! Address Book CLI
//!
//! `addressbook serve` runs the HTTP surface over an in-process store:
//! - `/rest/addressbook/tree` lists every Book with its Addresses,
//! - `/rest/addressbook/testdata` seeds a sample Book,
//! - `/rest/addressbook/testdataDestructor` purges everything (needs `Delete`),
//! - `/rest/addressbook/userinfo` echoes the caller.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod http_server;
mod identity;

#[derive(Parser)]
#[command(name = "addressbook")]
#[command(author, version, about = "Address book backend")]
struct Cli {
    /// Log filter (overrides `RUST_LOG`), e.g. `debug` or `addressbook_core=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Listen address (use `127.0.0.1:0` to auto-pick a free port).
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Bearer token directory (JSON: `{"tokens": {"<token>": {"user": .., "scopes": [..]}}}`).
    #[arg(long, env = "ADDRESSBOOK_TOKENS")]
    tokens: Option<PathBuf>,

    /// If set, write a small JSON file once the server is listening.
    ///
    /// Useful for scripts/tests to learn the chosen port when `--listen ...:0`.
    #[arg(long)]
    ready_file: Option<PathBuf>,
}

fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level)
            .map_err(|e| anyhow!("invalid --log-level `{level}`: {e}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    match cli.command {
        Commands::Serve(args) => http_server::cmd_serve(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["addressbook", "serve", "--tokens", "t.json"]).unwrap();
        let Commands::Serve(args) = cli.command;
        assert_eq!(args.listen, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(args.tokens, Some(PathBuf::from("t.json")));
        assert!(args.ready_file.is_none());
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn log_level_is_global() {
        let cli = Cli::try_parse_from([
            "addressbook",
            "serve",
            "--tokens",
            "t.json",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}

use std::io::{Read, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "oncelink", about = "oncelink: one-time secret links", version)]
struct Cli {
    /// oncelink server URL (default: http://localhost:8080 or $ONCELINK_SERVER)
    #[arg(long, env = "ONCELINK_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the oncelink HTTP server
    Serve {
        /// Port to listen on (default: $ONCELINK_PORT or 8080)
        #[arg(long, env = "ONCELINK_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $ONCELINK_HOST or 0.0.0.0)
        #[arg(long, env = "ONCELINK_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Store a secret and print its one-time URL
    Create {
        /// The secret, or `-` to read it from stdin (one trailing newline is dropped)
        secret: String,
    },
    /// Reveal a secret once, by URL or id
    Reveal {
        /// Full URL, `/secret/<id>` path, or bare id
        target: String,
    },
    /// Print a fresh 256-bit key as hex, suitable for $ONCELINK_KEY
    Keygen,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ONCELINK_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,
        Commands::Create { secret } => cmd_create(&cli.server, &secret).await,
        Commands::Reveal { target } => cmd_reveal(&cli.server, &target).await,
        Commands::Keygen => {
            println!("{}", oncelink_server::crypto::generate_key().to_hex());
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = oncelink_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    oncelink_server::run(cfg).await
}

async fn cmd_create(server: &str, secret: &str) -> Result<()> {
    let secret = if secret == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read secret from stdin")?;
        if buf.ends_with('\n') {
            buf.pop();
            if buf.ends_with('\r') {
                buf.pop();
            }
        }
        buf
    } else {
        secret.to_owned()
    };

    let resp = Client::new()
        .post(format!("{}/secret", base(server)))
        .json(&serde_json::json!({ "secret": secret }))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("server returned {status}: {text}");
    }

    let json: Value = resp.json().await.context("parse response")?;
    let url = json["url"]
        .as_str()
        .context("response is missing `url`")?;

    if url.starts_with('/') {
        println!("{}{url}", base(server));
    } else {
        println!("{url}");
    }
    Ok(())
}

async fn cmd_reveal(server: &str, target: &str) -> Result<()> {
    let url = reveal_url(server, target);
    let resp = Client::new()
        .get(&url)
        .send()
        .await
        .context("HTTP request failed")?;

    match resp.status() {
        StatusCode::OK => {
            let body = resp.bytes().await.context("read response body")?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&body)?;
            stdout.flush()?;
            Ok(())
        }
        StatusCode::NOT_FOUND => anyhow::bail!("secret not found, already revealed, or expired"),
        StatusCode::BAD_REQUEST => anyhow::bail!("not a valid secret id: {target}"),
        status => {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("server returned {status}: {text}")
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn base(server: &str) -> &str {
    server.trim_end_matches('/')
}

fn reveal_url(server: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_owned()
    } else if target.starts_with("/secret/") {
        format!("{}{target}", base(server))
    } else {
        format!("{}/secret/{target}", base(server))
    }
}

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::net::TcpListener;

use dax::prelude::*;

/// The tag server daemon.
#[derive(Clone, Debug, Parser)]
struct Args {
    /// address to listen on, host:port
    #[arg(short, long)]
    listen: Option<String>,
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// log everything the server does
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Default, Deserialize)]
struct Config {
    listen: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let Some(path) = &args.config else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn epoch_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(_) => 0,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    let config = load_config(&args)?;
    let listen = args
        .listen
        .or(config.listen)
        .unwrap_or_else(|| "127.0.0.1:7777".to_string());

    let server = Server::new();

    // The server's clock, published as a virtual tag so clients can read
    // it like any other value.
    let index = server
        .tagbase()
        .add(
            "_servertime",
            TagType::TIME,
            1,
            TagAttr::SPECIAL | TagAttr::READONLY | TagAttr::VIRTUAL,
        )
        .map_err(|err| anyhow::anyhow!("registering _servertime: {err}"))?;
    server
        .tagbase()
        .set_virtual_read(index, Box::new(|_| Ok(epoch_millis().to_le_bytes().to_vec())))
        .map_err(|err| anyhow::anyhow!("serving _servertime: {err}"))?;

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;

    let accept = server.clone();
    tokio::spawn(async move {
        if let Err(err) = accept.serve(listener).await {
            log::error!("accept loop failed: {err}");
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    Ok(())
}

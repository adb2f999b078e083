mod config;
mod session;
mod tracker;

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use iori_adaptive::{
    fetch::{HttpClient, HttpTransport},
    time::SystemClock,
};
use reqwest::{Client, Url};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::{config::Config, session::Session};

/// Watches a HLS or DASH manifest and prints every chunk decision made against it.
#[derive(Parser, Debug)]
#[clap(version, author)]
struct KanshiArgs {
    /// Manifest URL. Paths ending with `.mpd` are read as DASH, anything else as HLS
    url: Url,

    /// Configuration file in TOML format
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds
    #[clap(short, long)]
    duration: Option<u64>,

    /// Stop at the end of an ended playlist instead of loading its last segment again
    #[clap(long)]
    allow_end_of_stream: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = KanshiArgs::parse();

    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .try_from_env()
                .unwrap_or_else(|_| EnvFilter::new(level.to_string())),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref())?;

    let mut builder = Client::builder().timeout(Duration::from_secs(config.http.timeout_secs));
    if let Some(user_agent) = &config.http.user_agent {
        builder = builder.user_agent(user_agent);
    }
    let client = HttpClient::new(builder)?;
    client.add_cookies(&config.http.cookies, &args.url);
    let transport = HttpTransport::new(client)
        .with_retries(config.http.retries)
        .with_retry_delay(Duration::from_millis(config.http.retry_delay_ms));

    let session = Session::new(
        args.url,
        config,
        SystemClock::shared(),
        transport,
        args.allow_end_of_stream,
    );
    session.run(args.duration.map(Duration::from_secs)).await
}

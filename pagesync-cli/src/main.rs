use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pagesync_engine::{EventChannel, SyncEvent, SyncParams, Synchronizer};
use pagesync_store::{Auth, RestStore};

#[derive(Parser)]
#[command(name = "pagesync")]
#[command(about = "Copy a wiki page hierarchy between two content stores")]
#[command(group(
    ArgGroup::new("source_auth").required(true).args(["source_basic", "source_token"])
))]
#[command(group(
    ArgGroup::new("dest_auth").required(true).args(["dest_basic", "dest_token"])
))]
struct Cli {
    /// Source store base URL
    #[arg(long)]
    source_url: String,
    /// Source username and password separated by a colon
    #[arg(long)]
    source_basic: Option<String>,
    /// Source bearer token
    #[arg(long)]
    source_token: Option<String>,
    /// Space holding the hierarchy to copy
    #[arg(long)]
    source_space: String,
    /// Title of the hierarchy root
    #[arg(long)]
    source_title: String,

    /// Destination store base URL
    #[arg(long)]
    dest_url: String,
    /// Destination username and password separated by a colon
    #[arg(long)]
    dest_basic: Option<String>,
    /// Destination bearer token
    #[arg(long)]
    dest_token: Option<String>,
    /// Space the copy is written into
    #[arg(long)]
    dest_space: String,
    /// Existing destination page to copy under; the space homepage when
    /// omitted
    #[arg(long)]
    dest_title: Option<String>,

    /// Also copy referenced pages outside the hierarchy
    #[arg(long)]
    sync_out_hierarchy: bool,
    /// Replace a page title substring with a new one
    #[arg(long, num_args = 2, value_names = ["OLD", "NEW"])]
    replace_title_substr: Option<Vec<String>>,
    /// Add a prefix to every copied page title
    #[arg(long)]
    start_title_with: Option<String>,
    /// Concurrent page tasks per hierarchy level
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn auth(basic: Option<String>, token: Option<String>, side: &str) -> Result<Auth> {
    if let Some(basic) = basic {
        let (username, password) = basic
            .split_once(':')
            .with_context(|| format!("--{side}-basic must be USER:PASSWORD"))?;
        return Ok(Auth::Basic {
            username: username.to_string(),
            password: password.to_string(),
        });
    }
    if let Some(token) = token {
        return Ok(Auth::Token(token));
    }
    bail!("missing --{side}-basic or --{side}-token");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let source = RestStore::new(
        &cli.source_url,
        auth(cli.source_basic.clone(), cli.source_token.clone(), "source")?,
    )?;
    let dest = RestStore::new(
        &cli.dest_url,
        auth(cli.dest_basic.clone(), cli.dest_token.clone(), "dest")?,
    )?;

    let mut params = SyncParams::new(&cli.source_space, &cli.source_title, &cli.dest_space)
        .sync_out_hierarchy(cli.sync_out_hierarchy)
        .max_concurrency(cli.concurrency);
    if let Some(title) = &cli.dest_title {
        params = params.dest_title(title);
    }
    if let Some(replace) = &cli.replace_title_substr {
        params = params.replace_title_substr(&replace[0], &replace[1]);
    }
    if let Some(prefix) = &cli.start_title_with {
        params = params.start_title_with(prefix);
    }

    info!(
        "Syncing \"{}\" from space \"{}\" into space \"{}\"",
        cli.source_title, cli.source_space, cli.dest_space
    );

    let (reporter, mut channel) = EventChannel::new();
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{msg} {wide_bar} {pos}/{len}")
            .context("invalid progress bar template")?,
    );
    bar.set_message("Synced page count");

    let bar_task = tokio::spawn(async move {
        while let Some(event) = channel.recv().await {
            match event {
                SyncEvent::TotalPageCountChanged { total } => bar.set_length(total as u64),
                SyncEvent::SyncedPageCountChanged { count } => bar.set_position(count as u64),
            }
        }
        bar.finish();
    });

    let result = Synchronizer::new(Arc::new(source), Arc::new(dest))
        .sync_page_hierarchy(params, Some(reporter))
        .await;
    let _ = bar_task.await;

    let report = result.context("synchronization failed")?;
    println!(
        "Synced {} pages ({} placeholders, {} diagram fixes)",
        report.pages_synced, report.nominal_pages, report.diagrams_fixed
    );

    Ok(())
}

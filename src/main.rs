mod binder;
mod cli;
mod config;
mod engine;
mod errors;
mod grouping;
mod history;
mod parsers;
mod progress;
mod source;
mod types;
mod utils;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use binder::LogBinder;
use cli::Cli;
use config::FileConfig;
use engine::ParseEngine;
use history::HistoryBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the timeline
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // One binder per run; bindings are never carried over
    let binder = Arc::new(LogBinder::new());

    if cli.list_parsers {
        for parser in parsers::all(binder) {
            let deps = parser
                .dependencies()
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",");
            println!(
                "{:<12} log_type={:<10} grouping={} depends_on={}",
                parser.name(),
                parser.log_type(),
                parser.grouping(),
                deps
            );
        }
        return Ok(());
    }

    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let engine_config = config::resolve(&cli, &file_config)?;

    let parser_name = cli
        .parser
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("--parser is required"))?;
    let mut parser = parsers::by_name(parser_name, binder)?;
    if cli.sequential {
        parser = parsers::sequential(parser);
    }
    let input = cli
        .input
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("An input log file is required"))?;
    let records = source::load_records(input)?;

    let engine = ParseEngine::new(engine_config);
    let builder = Arc::new(HistoryBuilder::new());
    let cancel = CancellationToken::new();

    // Ctrl-C stops admitting new groups; the partial history is still emitted
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight logs");
            interrupt.cancel();
        }
    });

    let mut progress = WatchStream::from_changes(engine.progress().subscribe());
    let progress_task = tokio::spawn(async move {
        while let Some(snapshot) = progress.next().await {
            info!(
                "[{}] {:.1}% {}",
                snapshot.phase, snapshot.percentage, snapshot.message
            );
        }
    });

    let result = engine.run(records, parser, builder.clone(), cancel).await;
    // Dropping the engine closes the progress channel
    drop(engine);
    if let Err(e) = progress_task.await {
        warn!("Progress logger ended abnormally: {}", e);
    }
    let summary = result?;

    let history = builder.finalize();
    match &cli.output {
        Some(path) => {
            let yaml = serde_yaml::to_string(&history)?;
            std::fs::write(path, yaml)
                .with_context(|| format!("Failed to write history to {}", path.display()))?;
            info!(
                "Wrote {} timelines to {}",
                history.timelines.len(),
                path.display()
            );
        }
        None => {
            let color = std::io::stdout().is_terminal();
            for line in utils::render_timeline(&history, color) {
                println!("{}", line);
            }
        }
    }

    if summary.failed > 0 {
        warn!(
            "{} of {} logs failed to parse; run with --verbose for details",
            summary.failed,
            summary.parsed + summary.skipped + summary.failed
        );
    }
    Ok(())
}

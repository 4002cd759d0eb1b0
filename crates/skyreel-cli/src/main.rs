use std::fs::File;
use std::io::{BufWriter, Write};

use chrono::{TimeZone, Utc};
use clap::Parser;
use skyreel_core::CatalogFilter;
use skyreel_logging::SkyreelSubscriberBuilder;
use skyreel_recorder::{IngestOutcome, WorkerMessage};
use skyreel_cli::{Cli, Command, Service, ServiceConfig};

fn format_start(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn format_duration(millis: i64) -> String {
    let secs = millis.max(0) / 1000;
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(level) = cli.log_level {
        config.logging.default_level = level;
    }

    // Keep the guard alive so file output is flushed on exit
    let _guard = SkyreelSubscriberBuilder::new()
        .with_config(config.logging.clone())
        .init();

    let service = Service::open(&config).await?;

    match cli.command {
        Command::Recover => {
            let report = service.recover().await?;
            println!("Finalized {} dangling session(s)", report.finalized);
            println!(
                "Inbound: {} ingested, {} already present, {} skipped, {} invalid",
                report.inbound.ingested.len(),
                report.inbound.already_present.len(),
                report.inbound.skipped.len(),
                report.inbound.invalid.len()
            );
            for (path, reason) in &report.inbound.invalid {
                println!("  invalid: {} ({})", path.display(), reason);
            }
        }

        Command::Ingest { path } => match service.ingest(&path).await? {
            IngestOutcome::Ingested(id) => println!("Ingested {id}"),
            IngestOutcome::AlreadyExists(id) => println!("Already catalogued: {id}"),
        },

        Command::List {
            lobby,
            player,
            host,
            limit,
        } => {
            let mut filter = CatalogFilter::all();
            if let Some(q) = lobby {
                filter = filter.with_lobby_name(q);
            }
            if let Some(q) = player {
                filter = filter.with_player_name(q);
            }
            if let Some(q) = host {
                filter = filter.with_host_name(q);
            }
            if let Some(n) = limit {
                filter = filter.with_limit(n);
            }

            let summaries = service.list(&filter).await?;
            for summary in &summaries {
                let info = &summary.info;
                println!(
                    "{}  {}  {:>9}  {}  host={}  mission={}",
                    summary.id,
                    format_start(info.start_time),
                    format_duration(info.duration),
                    info.lobby_name,
                    info.host_name.as_deref().unwrap_or("-"),
                    info.mission_name,
                );
            }
            println!("{} recording(s)", summaries.len());
        }

        Command::Dump { id, out } => {
            let summary = match out {
                Some(path) => {
                    let mut writer = BufWriter::new(File::create(&path)?);
                    service.dump(&id, &mut writer).await?
                }
                None => {
                    let mut writer = BufWriter::new(std::io::stdout());
                    let summary = service.dump(&id, &mut writer).await?;
                    writer.flush()?;
                    summary
                }
            };
            eprintln!(
                "{} event(s) from {} chunk(s), {} corrupt{}",
                summary.events,
                summary.chunks_decoded,
                summary.corrupt_chunks,
                if summary.truncated { ", truncated" } else { "" }
            );
        }

        Command::Extract => {
            let (count, mut messages) = service.extract().await?;
            let mut failed = 0;
            while let Some(message) = messages.recv().await {
                match message {
                    WorkerMessage::Progress {
                        worker_id,
                        current,
                        total,
                    } => {
                        tracing::debug!(worker_id, current, total, "Extraction progress");
                    }
                    WorkerMessage::Finished {
                        container_id,
                        result,
                        ..
                    } => match result {
                        Ok(metadata) => println!(
                            "{container_id}: {} events, {} spawns, {} players",
                            metadata.total_events,
                            metadata.net_instantiates,
                            metadata.players.len()
                        ),
                        Err(e) => {
                            failed += 1;
                            println!("{container_id}: failed: {e}");
                        }
                    },
                }
            }
            println!("Extracted {} of {count} recording(s)", count - failed);
        }
    }

    Ok(())
}

// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::Settings;
use crate::content::metainfo::Metainfo;
use crate::engine::{Engine, SeedSource};
use crate::session::{ProgressEvent, SessionHandle, SessionOutcome};

use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Seed files and print the link that downloads them.
    Seed {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Also write a metainfo file describing the content.
        #[arg(long)]
        metainfo: Option<PathBuf>,
    },
    /// Download content by share link or metainfo file.
    Download {
        link: String,

        /// Directory the files are written to.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

pub async fn run(cli: Cli, settings: Settings) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Commands::Seed { paths, metainfo } => run_seed(settings, paths, metainfo).await,
        Commands::Download { link, out } => run_download(settings, link, out).await,
    }
}

async fn run_seed(
    settings: Settings,
    paths: Vec<PathBuf>,
    metainfo_path: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let engine = Engine::new(settings).await?;
    let sources = paths.into_iter().map(SeedSource::Path).collect();
    let seeding = engine.start_seeding(sources).await?;

    println!("{}", seeding.link);
    if let Some(path) = metainfo_path {
        let metainfo = Metainfo {
            descriptor: (*seeding.descriptor).clone(),
            endpoints: seeding.link.endpoints.clone(),
        };
        tokio::fs::write(&path, metainfo.to_bytes()?).await?;
        println!("Metainfo written to {}", path.display());
    }
    println!("Seeding on port {}. Press Ctrl-C to stop.", engine.listen_addr().port());

    tokio::select! {
        _ = signal::ctrl_c() => {}
        outcome = seeding.session.wait() => {
            if let SessionOutcome::Failed { cause } = outcome {
                eprintln!("Seeding failed: {}", cause);
            }
        }
    }
    engine.shutdown().await;
    Ok(())
}

async fn run_download(
    mut settings: Settings,
    link: String,
    out: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    if let Some(out) = out {
        settings.download_folder = Some(out);
    }
    if settings.download_folder.is_none() {
        settings.download_folder = Some(std::env::current_dir()?);
    }
    let sample_interval = Duration::from_millis(settings.progress_sample_ms.max(50));

    let engine = Engine::new(settings).await?;
    let handle = if link.trim_start().starts_with("magnet:") {
        engine.start_download_str(&link)?
    } else {
        let metainfo = Metainfo::from_bytes(&tokio::fs::read(&link).await?)?;
        engine.start_download_descriptor(metainfo.descriptor, metainfo.endpoints)?
    };

    let outcome = follow_progress(&handle, sample_interval).await;
    let result = report_outcome(outcome).await;
    engine.shutdown().await;
    result
}

async fn follow_progress(handle: &SessionHandle, sample_interval: Duration) -> SessionOutcome {
    let mut sampler = tokio::time::interval(sample_interval);
    let mut last_line = String::new();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                handle.stop();
            }
            outcome = handle.wait() => {
                println!("{}", progress_line(&handle.snapshot()));
                return outcome;
            }
            _ = sampler.tick() => {
                let line = progress_line(&handle.snapshot());
                if line != last_line {
                    println!("{}", line);
                    last_line = line;
                }
            }
        }
    }
}

async fn report_outcome(outcome: SessionOutcome) -> Result<(), Box<dyn Error>> {
    match outcome {
        SessionOutcome::Completed { files, summary } => {
            if let Some(summary) = summary {
                println!(
                    "Finished in {:.1}s (transferring {:.1}s, idle {:.1}s)",
                    summary.total.as_secs_f64(),
                    summary.transfer.as_secs_f64(),
                    summary.idle.as_secs_f64()
                );
            }
            for file in files {
                let location = file
                    .handle
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(memory)".to_string());
                println!(
                    "  {} ({}) -> {}",
                    file.file_name,
                    format_bytes(file.byte_range.end - file.byte_range.start),
                    location
                );
            }
            Ok(())
        }
        SessionOutcome::Failed { cause } => Err(cause.into()),
        SessionOutcome::Stopped => {
            println!("Download stopped.");
            Ok(())
        }
    }
}

pub fn progress_line(progress: &ProgressEvent) -> String {
    format!(
        "[{}] {}/{} pieces ({:.1}%) {} down, {} up, {}/s, {} peers",
        progress.state,
        progress.owned_pieces,
        progress.total_pieces,
        progress.completion_ratio() * 100.0,
        format_bytes(progress.bytes_downloaded),
        format_bytes(progress.bytes_uploaded),
        format_bytes(progress.throughput_bps as u64),
        progress.connected_peers
    )
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentId;
    use crate::session::TransferState;

    #[test]
    fn test_parse_seed_command() {
        let cli = Cli::try_parse_from(["seedlink", "seed", "a.txt", "b.txt", "--metainfo", "out.meta"]).unwrap();
        match cli.command {
            Commands::Seed { paths, metainfo } => {
                assert_eq!(paths, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
                assert_eq!(metainfo, Some(PathBuf::from("out.meta")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_seed_requires_a_path() {
        assert!(Cli::try_parse_from(["seedlink", "seed"]).is_err());
    }

    #[test]
    fn test_parse_download_command() {
        let cli = Cli::try_parse_from(["seedlink", "download", "magnet:?xt=urn:btih:00", "--out", "/tmp/x"]).unwrap();
        match cli.command {
            Commands::Download { link, out } => {
                assert_eq!(link, "magnet:?xt=urn:btih:00");
                assert_eq!(out, Some(PathBuf::from("/tmp/x")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_progress_line() {
        let mut progress = ProgressEvent::initial(ContentId([1; 20]));
        progress.state = TransferState::Exchanging;
        progress.owned_pieces = 3;
        progress.total_pieces = 4;
        progress.bytes_downloaded = 2048;
        progress.connected_peers = 2;
        assert_eq!(
            progress_line(&progress),
            "[exchanging] 3/4 pieces (75.0%) 2.0 KiB down, 0 B up, 0 B/s, 2 peers"
        );
    }
}

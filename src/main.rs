// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use seedlink::cli::{self, Cli};
use seedlink::config::{self, generate_client_id_string, load_settings};

use std::env;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: LevelFilter = LevelFilter::INFO;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let base_data_dir = config::get_app_paths()
        .map(|(_, data_dir)| data_dir)
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let log_dir = base_data_dir.join("logs");
    fs::create_dir_all(&log_dir)?;
    let general_log = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(31)
        .filename_prefix("seedlink")
        .filename_suffix("log")
        .build(&log_dir)?;
    let (non_blocking_general, _guard_general) = tracing_appender::non_blocking(general_log);

    let quiet_filter = Targets::new()
        .with_default(DEFAULT_LOG_FILTER)
        .with_target("reqwest", LevelFilter::WARN)
        .with_target("hyper_util", LevelFilter::WARN);
    let general_layer = fmt::layer()
        .with_writer(non_blocking_general)
        .with_ansi(false)
        .with_filter(quiet_filter);
    let _ = tracing_subscriber::registry().with(general_layer).try_init();

    tracing::info!("STARTING SEEDLINK");

    let mut settings = load_settings();
    if settings.client_id.is_empty() {
        settings.client_id = generate_client_id_string();
        if let Err(e) = config::save_settings(&settings) {
            tracing::error!("Failed to save settings after generating client ID: {}", e);
        }
    }

    let result = cli::run(cli, settings).await;
    if let Err(e) = &result {
        tracing::error!("seedlink exited with an error: {}", e);
    }
    result
}

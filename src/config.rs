// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format};
use figment::{providers::Toml, Figment};

use directories::ProjectDirs;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PIECE_LENGTH: u32 = 256 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub client_id: String,
    /// Listen port for incoming peers. `0` picks an ephemeral port.
    pub client_port: u16,

    // Content
    pub piece_length: u32,
    pub download_folder: Option<PathBuf>,
    pub verify_on_completion: bool,

    // Discovery
    pub discovery_endpoints: Vec<String>,
    pub discovery_timeout_ms: u64,
    pub announce_interval_secs: u64,
    pub max_discovery_rounds: u32,
    pub rediscovery_delay_ms: u64,

    // Networking
    pub connection_attempt_permits: usize,
    pub connect_timeout_ms: u64,
    pub max_connected_peers: usize,
    pub global_download_limit_bps: u64,
    pub global_upload_limit_bps: u64,

    // Exchange
    pub max_requests_per_session: usize,
    pub max_requests_per_peer: usize,
    pub max_verification_failures: u32,

    // Reporting
    pub progress_sample_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_port: 6691,
            piece_length: DEFAULT_PIECE_LENGTH,
            download_folder: None,
            verify_on_completion: true,
            discovery_endpoints: vec!["http://tracker.opentrackr.org:1337/announce".to_string()],
            discovery_timeout_ms: 5_000,
            announce_interval_secs: 300,
            max_discovery_rounds: 3,
            rediscovery_delay_ms: 2_000,
            connection_attempt_permits: 16,
            connect_timeout_ms: 2_000,
            max_connected_peers: 50,
            global_download_limit_bps: 0,
            global_upload_limit_bps: 0,
            max_requests_per_session: 32,
            max_requests_per_peer: 4,
            max_verification_failures: 3,
            progress_sample_ms: 500,
        }
    }
}

impl Settings {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs.max(1))
    }

    pub fn rediscovery_delay(&self) -> Duration {
        Duration::from_millis(self.rediscovery_delay_ms)
    }

    /// The 20 byte peer id sent in every handshake and announce.
    pub fn peer_id(&self) -> [u8; 20] {
        let mut id = [0u8; 20];
        let source = self.client_id.as_bytes();
        let len = source.len().min(20);
        id[..len].copy_from_slice(&source[..len]);
        id
    }
}

pub fn generate_client_id_string() -> String {
    const CLIENT_PREFIX: &str = "-SL0100-";
    const RANDOM_LEN: usize = 12;

    let mut rng = rand::rng();
    let random_chars: String = (0..RANDOM_LEN)
        .map(|_| {
            const CHARSET: &[u8] =
                b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect();

    format!("{}{}", CLIENT_PREFIX, random_chars)
}

/// Returns `(config_dir, data_dir)`, creating both.
pub fn get_app_paths() -> Option<(PathBuf, PathBuf)> {
    let proj_dirs = ProjectDirs::from("com", "github", "seedlink")?;
    let config_dir = proj_dirs.config_dir().to_path_buf();
    let data_dir = proj_dirs.data_local_dir().to_path_buf();

    fs::create_dir_all(&config_dir).ok()?;
    fs::create_dir_all(&data_dir).ok()?;

    Some((config_dir, data_dir))
}

fn settings_figment(config_file: Option<PathBuf>) -> Figment {
    let mut figment = Figment::new();
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("SEEDLINK_"))
}

pub fn load_settings() -> Settings {
    let config_file = get_app_paths().map(|(config_dir, _)| config_dir.join("settings.toml"));

    match settings_figment(config_file).extract::<Settings>() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Falling back to default settings: {}", e);
            Settings::default()
        }
    }
}

pub fn save_settings(settings: &Settings) -> io::Result<()> {
    if let Some((config_dir, _)) = get_app_paths() {
        let config_file_path = config_dir.join("settings.toml");
        let temp_file_path = config_dir.join("settings.toml.tmp");
        let content = toml::to_string_pretty(settings).map_err(io::Error::other)?;
        fs::write(&temp_file_path, content)?;
        fs::rename(&temp_file_path, &config_file_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::{Format, Toml};
    use figment::Figment;

    #[test]
    fn test_full_settings_parsing() {
        let toml_str = r#"
            client_id = "-SL0100-abcdefghijkl"
            client_port = 7000
            piece_length = 65536
            download_folder = "/tmp/downloads"
            verify_on_completion = false

            discovery_endpoints = ["http://a.example/announce", "http://b.example/announce"]
            discovery_timeout_ms = 1500
            announce_interval_secs = 60
            max_discovery_rounds = 5
            rediscovery_delay_ms = 100

            connection_attempt_permits = 4
            connect_timeout_ms = 750
            max_connected_peers = 10
            global_download_limit_bps = 1048576
            global_upload_limit_bps = 524288

            max_requests_per_session = 8
            max_requests_per_peer = 2
            max_verification_failures = 5
            progress_sample_ms = 250
        "#;

        let settings: Settings = Figment::new()
            .merge(Toml::string(toml_str))
            .extract()
            .expect("Failed to parse full TOML string");

        assert_eq!(settings.client_id, "-SL0100-abcdefghijkl");
        assert_eq!(settings.client_port, 7000);
        assert_eq!(settings.piece_length, 65536);
        assert_eq!(settings.download_folder, Some(PathBuf::from("/tmp/downloads")));
        assert!(!settings.verify_on_completion);
        assert_eq!(
            settings.discovery_endpoints,
            vec!["http://a.example/announce", "http://b.example/announce"]
        );
        assert_eq!(settings.discovery_timeout(), Duration::from_millis(1500));
        assert_eq!(settings.max_discovery_rounds, 5);
        assert_eq!(settings.connection_attempt_permits, 4);
        assert_eq!(settings.global_upload_limit_bps, 524288);
        assert_eq!(settings.max_requests_per_session, 8);
        assert_eq!(settings.max_verification_failures, 5);
        assert_eq!(settings.progress_sample_ms, 250);
    }

    #[test]
    fn test_partial_settings_override() {
        let toml_str = r#"
            client_port = 9999
            max_verification_failures = 7
        "#;

        let settings: Settings = Figment::new()
            .merge(Toml::string(toml_str))
            .extract()
            .expect("Failed to parse partial TOML string");
        let default_settings = Settings::default();

        assert_eq!(settings.client_port, 9999);
        assert_eq!(settings.max_verification_failures, 7);
        assert_eq!(settings.piece_length, default_settings.piece_length);
        assert_eq!(
            settings.discovery_endpoints,
            default_settings.discovery_endpoints
        );
        assert!(settings.verify_on_completion);
    }

    #[test]
    fn test_default_settings() {
        let settings: Settings = Figment::new()
            .merge(Toml::string(""))
            .extract()
            .expect("Failed to parse empty string");

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.max_verification_failures, 3);
        assert!(settings.download_folder.is_none());
    }

    #[test]
    fn test_invalid_type_is_rejected() {
        let toml_str = r#"
            client_port = "not a port"
        "#;

        let result: Result<Settings, figment::Error> =
            Figment::new().merge(Toml::string(toml_str)).extract();

        let error = result.expect_err("Parsing should fail for a string port");
        assert!(error.to_string().contains("client_port"));
    }

    #[test]
    fn test_peer_id_is_padded_to_twenty_bytes() {
        let settings = Settings {
            client_id: "-SL0100-".to_string(),
            ..Settings::default()
        };
        let id = settings.peer_id();
        assert_eq!(&id[..8], b"-SL0100-");
        assert!(id[8..].iter().all(|b| *b == 0));

        let generated = generate_client_id_string();
        assert_eq!(generated.len(), 20);
        assert!(generated.starts_with("-SL0100-"));
    }
}

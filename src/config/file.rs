//! TOML configuration file loading
//!
//! Supports `~/.config/avatar/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct AvatarConfigFile {
    /// Relay server configuration
    #[serde(default)]
    pub relay: RelayFileConfig,

    /// Egress proxy used for the upstream leg
    #[serde(default)]
    pub egress: Option<EgressFileConfig>,

    /// Local client configuration
    #[serde(default)]
    pub client: ClientFileConfig,
}

/// Relay server configuration
#[derive(Debug, Default, Deserialize)]
pub struct RelayFileConfig {
    /// Port to listen on
    pub port: Option<u16>,

    /// WebSocket path for client legs (e.g. "/gemini-proxy")
    pub path: Option<String>,

    /// Upstream speech service WebSocket URL, without the key parameter
    pub upstream_url: Option<String>,

    /// Upstream API key
    pub api_key: Option<String>,

    /// Cap on frames buffered before the upstream leg opens
    pub max_pending_frames: Option<usize>,
}

/// HTTP `CONNECT` proxy configuration
#[derive(Debug, Default, Deserialize)]
pub struct EgressFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Local client configuration
#[derive(Debug, Default, Deserialize)]
pub struct ClientFileConfig {
    /// Relay WebSocket URL (e.g. "ws://localhost:3001/gemini-proxy")
    pub relay_url: Option<String>,

    /// Model identifier sent in the setup message
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Aoede")
    pub voice_name: Option<String>,

    /// System instruction text
    pub system_instruction: Option<String>,

    /// Greeting prompt sent after setup completes; empty disables it
    pub greeting: Option<String>,

    /// Linear gain applied to captured samples
    pub input_gain: Option<f32>,

    /// Multiplier turning RMS into the 0..1 loudness readout
    pub volume_scale: Option<f32>,

    /// Sample rate the service expects for input audio
    pub target_rate: Option<u32>,

    /// Samples per capture block
    pub block_size: Option<usize>,

    /// Playback sample rate
    pub playback_rate: Option<u32>,

    /// Scheduling lead after an underrun, in milliseconds
    pub lookahead_ms: Option<u64>,

    /// Animation frames per second
    pub animation_fps: Option<u32>,

    /// Which audio drives the lip-sync ("output", "capture" or "auto")
    pub lip_sync_source: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `AvatarConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> AvatarConfigFile {
    let Some(path) = config_file_path() else {
        return AvatarConfigFile::default();
    };

    if !path.exists() {
        return AvatarConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                AvatarConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            AvatarConfigFile::default()
        }
    }
}

/// Return the config file path
///
/// `AVATAR_CONFIG` overrides the default `~/.config/avatar/config.toml`.
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("AVATAR_CONFIG") {
        return Some(PathBuf::from(path));
    }
    directories::BaseDirs::new().map(|d| d.config_dir().join("avatar").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_parses() {
        let fc: AvatarConfigFile = toml::from_str(
            r#"
            [relay]
            port = 4000

            [client]
            voice_name = "Puck"
            lip_sync_source = "auto"
            "#,
        )
        .unwrap();

        assert_eq!(fc.relay.port, Some(4000));
        assert!(fc.relay.upstream_url.is_none());
        assert!(fc.egress.is_none());
        assert_eq!(fc.client.voice_name.as_deref(), Some("Puck"));
        assert_eq!(fc.client.lip_sync_source.as_deref(), Some("auto"));
    }

    #[test]
    fn test_egress_section() {
        let fc: AvatarConfigFile = toml::from_str(
            r#"
            [egress]
            host = "10.0.0.1"
            port = 8080
            "#,
        )
        .unwrap();

        let egress = fc.egress.unwrap();
        assert_eq!(egress.host.as_deref(), Some("10.0.0.1"));
        assert_eq!(egress.port, Some(8080));
        assert!(egress.username.is_none());
    }
}

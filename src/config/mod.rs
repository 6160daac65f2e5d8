//! Configuration management for the avatar gateway
//!
//! Every setting resolves as env > TOML file > default.

pub mod file;

use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::avatar::LipSyncSource;
use crate::{Error, Result};

use self::file::AvatarConfigFile;

/// Default upstream endpoint for the bidirectional speech session
pub const DEFAULT_UPSTREAM_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// Default model requested in the setup message
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a friendly voice assistant shown as an on-screen avatar. \
Keep every answer short: two or three simple sentences. Be polite but not chatty.";

const DEFAULT_GREETING: &str = "Greet the user briefly and introduce yourself.";

/// Gateway configuration
#[derive(Debug)]
pub struct Config {
    /// Relay server configuration
    pub relay: RelayConfig,

    /// Local client configuration
    pub client: ClientConfig,
}

/// Relay server configuration
#[derive(Debug)]
pub struct RelayConfig {
    /// Port to listen on
    pub port: u16,

    /// WebSocket path client legs connect to
    pub path: String,

    /// Upstream WebSocket URL without the key parameter
    pub upstream_url: String,

    /// Upstream API key (from `GEMINI_API_KEY`)
    pub api_key: Option<SecretString>,

    /// Optional HTTP `CONNECT` proxy for the upstream leg
    pub egress: Option<EgressConfig>,

    /// Cap on frames buffered before the upstream leg opens; `None` is unbounded
    pub max_pending_frames: Option<usize>,
}

/// HTTP `CONNECT` proxy used as network egress
#[derive(Debug)]
pub struct EgressConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

/// Capture and encoder settings
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Fixed linear gain applied before anything else
    pub gain: f32,
    /// `volume = min(1, rms * volume_scale)`
    pub volume_scale: f32,
    /// Rate the service expects
    pub target_rate: u32,
    /// Samples per encoder callback
    pub block_size: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            gain: 3.0,
            volume_scale: 5.0,
            target_rate: 16_000,
            block_size: 128,
        }
    }
}

/// Playback settings
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    /// Output sample rate (the service emits 24 kHz)
    pub sample_rate: u32,
    /// Lead applied when the schedule cursor has fallen behind the device clock
    pub lookahead: Duration,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            lookahead: Duration::from_millis(50),
        }
    }
}

/// Local client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL
    pub relay_url: String,

    /// Model identifier
    pub model: String,

    /// Prebuilt voice name
    pub voice_name: String,

    /// System instruction text
    pub system_instruction: String,

    /// Greeting prompt sent once the setup is acknowledged
    pub greeting: Option<String>,

    /// Capture settings
    pub capture: CaptureSettings,

    /// Playback settings
    pub playback: PlaybackSettings,

    /// Animation frames per second
    pub animation_fps: u32,

    /// Which audio drives the lip-sync
    pub lip_sync_source: LipSyncSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:3001/gemini-proxy".to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice_name: "Aoede".to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            greeting: Some(DEFAULT_GREETING.to_string()),
            capture: CaptureSettings::default(),
            playback: PlaybackSettings::default(),
            animation_fps: 60,
            lip_sync_source: LipSyncSource::default(),
        }
    }
}

impl RelayConfig {
    /// Build the upstream request URL with the API key attached
    ///
    /// # Errors
    ///
    /// Returns error if no API key is configured or the URL is invalid
    pub fn upstream_request_url(&self) -> Result<url::Url> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Config("GEMINI_API_KEY is not set".to_string()))?;

        let mut url = url::Url::parse(&self.upstream_url)
            .map_err(|e| Error::Config(format!("invalid upstream url: {e}")))?;
        url.query_pairs_mut().append_pair("key", key.expose_secret());
        Ok(url)
    }

    /// Egress host reported by the health probe
    #[must_use]
    pub fn egress_host(&self) -> Option<&str> {
        self.egress.as_ref().map(|e| e.host.as_str())
    }
}

impl Config {
    /// Load configuration from the environment and the optional TOML file
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn resolve(fc: AvatarConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let relay = RelayConfig {
            port: parse_env(&env, "AVATAR_PORT")?
                .or(fc.relay.port)
                .unwrap_or(3001),
            path: fc.relay.path.unwrap_or_else(|| "/gemini-proxy".to_string()),
            upstream_url: env("AVATAR_UPSTREAM_URL")
                .or(fc.relay.upstream_url)
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
            api_key: env("GEMINI_API_KEY")
                .or(fc.relay.api_key)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            egress: resolve_egress(&env, fc.egress)?,
            max_pending_frames: parse_env(&env, "AVATAR_MAX_PENDING_FRAMES")?
                .or(fc.relay.max_pending_frames)
                .filter(|cap| *cap > 0),
        };

        if !relay.path.starts_with('/') {
            return Err(Error::Config(format!(
                "relay path must start with '/': {}",
                relay.path
            )));
        }

        let defaults = ClientConfig::default();
        let c = fc.client;
        let lip_sync_source = match env("AVATAR_LIPSYNC_SOURCE").or(c.lip_sync_source) {
            Some(s) => LipSyncSource::from_str(&s)?,
            None => defaults.lip_sync_source,
        };
        let greeting = c
            .greeting
            .map_or(defaults.greeting, |g| Some(g).filter(|g| !g.is_empty()));

        let client = ClientConfig {
            relay_url: env("AVATAR_RELAY_URL")
                .or(c.relay_url)
                .unwrap_or(defaults.relay_url),
            model: env("AVATAR_MODEL").or(c.model).unwrap_or(defaults.model),
            voice_name: env("AVATAR_VOICE").or(c.voice_name).unwrap_or(defaults.voice_name),
            system_instruction: c.system_instruction.unwrap_or(defaults.system_instruction),
            greeting,
            capture: CaptureSettings {
                gain: c.input_gain.unwrap_or(defaults.capture.gain),
                volume_scale: c.volume_scale.unwrap_or(defaults.capture.volume_scale),
                target_rate: c.target_rate.unwrap_or(defaults.capture.target_rate),
                block_size: c.block_size.unwrap_or(defaults.capture.block_size).max(1),
            },
            playback: PlaybackSettings {
                sample_rate: c.playback_rate.unwrap_or(defaults.playback.sample_rate),
                lookahead: c
                    .lookahead_ms
                    .map_or(defaults.playback.lookahead, Duration::from_millis),
            },
            animation_fps: c.animation_fps.unwrap_or(defaults.animation_fps).max(1),
            lip_sync_source,
        };

        Ok(Self { relay, client })
    }
}

/// Egress proxy from env (`PROXY_*`) or the `[egress]` table
fn resolve_egress(
    env: &impl Fn(&str) -> Option<String>,
    fc: Option<file::EgressFileConfig>,
) -> Result<Option<EgressConfig>> {
    let fc = fc.unwrap_or_default();
    let Some(host) = env("PROXY_HOST").or(fc.host).filter(|h| !h.is_empty()) else {
        return Ok(None);
    };

    let port = parse_env(env, "PROXY_PORT")?.or(fc.port).ok_or_else(|| {
        Error::Config(format!("egress proxy {host} configured without a port"))
    })?;

    Ok(Some(EgressConfig {
        host,
        port,
        username: env("PROXY_USER").or(fc.username),
        password: env("PROXY_PASS").or(fc.password).map(SecretString::from),
    }))
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {key}={raw}: {e}")))
        })
        .transpose()
}

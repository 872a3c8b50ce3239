use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::command::DEFAULT_COMMAND_PERIOD;
use crate::engine::{IceServer, MediaKind};
use crate::heartbeat::{DEFAULT_EVALUATION_PERIOD, DEFAULT_HEARTBEAT_TIMEOUT};
use crate::ice_buffer::DEFAULT_CANDIDATE_LIMIT;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const CONTROL_CHANNEL_LABEL: &str = "control";
pub const HEARTBEAT_TOKEN: &str = "alive";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// When the supervisor starts a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiationPolicy {
    /// As soon as the rendezvous link is up and the vehicle is heard from.
    OnConnect,
    /// Only when the vehicle announces itself with `hello`.
    OnHello,
}

impl FromStr for InitiationPolicy {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "connect" | "on-connect" => Ok(Self::OnConnect),
            "hello" | "on-hello" => Ok(Self::OnHello),
            _ => Err(()),
        }
    }
}

/// Rendezvous topics for one vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub signal_out: String,
    pub heartbeat_out: String,
    pub signal_in: String,
    pub heartbeat_in: String,
    pub telemetry_in: String,
}

impl Topics {
    pub fn for_vehicle(vehicle_id: &str) -> Self {
        let base = format!("tiller/{vehicle_id}");
        Self {
            signal_out: format!("{base}/operator/signal"),
            heartbeat_out: format!("{base}/operator/heartbeat"),
            signal_in: format!("{base}/vehicle/signal"),
            heartbeat_in: format!("{base}/vehicle/heartbeat"),
            telemetry_in: format!("{base}/vehicle/telemetry/#"),
        }
    }
}

/// Operator terminal configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub vehicle_id: String,
    pub initiation: InitiationPolicy,
    pub ice_servers: Vec<IceServer>,
    /// Period of both local heartbeat publishing and remote liveness evaluation.
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub command_period: Duration,
    pub candidate_limit: usize,
    pub control_label: String,
    pub receive_media: Vec<MediaKind>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vehicle_id: "boat".to_string(),
            initiation: InitiationPolicy::OnHello,
            ice_servers: vec![IceServer::new(DEFAULT_STUN_SERVER)],
            heartbeat_interval: DEFAULT_EVALUATION_PERIOD,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            command_period: DEFAULT_COMMAND_PERIOD,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            control_label: CONTROL_CHANNEL_LABEL.to_string(),
            receive_media: vec![MediaKind::Video],
        }
    }
}

fn parse_millis(var: &'static str, value: String) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(ConfigError::Invalid { var, value }),
    }
}

/// Parses `url[|username|credential]` entries separated by commas.
pub fn parse_ice_servers(value: &str) -> Result<Vec<IceServer>, ConfigError> {
    let mut servers = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let mut parts = entry.split('|');
        let url = parts.next().unwrap_or_default().trim();
        if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")) {
            return Err(ConfigError::Invalid {
                var: "TILLER_ICE_SERVERS",
                value: entry.to_string(),
            });
        }
        let mut server = IceServer::new(url);
        server.username = parts.next().map(str::to_string);
        server.credential = parts.next().map(str::to_string);
        servers.push(server);
    }
    Ok(servers)
}

impl Config {
    /// Load configuration from `TILLER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(vehicle) = lookup("TILLER_VEHICLE_ID").filter(|v| !v.trim().is_empty()) {
            config.vehicle_id = vehicle.trim().to_string();
        }
        if let Some(value) = lookup("TILLER_INITIATE") {
            config.initiation = value.parse().map_err(|_| ConfigError::Invalid {
                var: "TILLER_INITIATE",
                value,
            })?;
        }
        if let Some(value) = lookup("TILLER_ICE_SERVERS") {
            config.ice_servers = parse_ice_servers(&value)?;
        }
        if let Some(value) = lookup("TILLER_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = parse_millis("TILLER_HEARTBEAT_INTERVAL_MS", value)?;
        }
        if let Some(value) = lookup("TILLER_HEARTBEAT_TIMEOUT_MS") {
            config.heartbeat_timeout = parse_millis("TILLER_HEARTBEAT_TIMEOUT_MS", value)?;
        }
        if let Some(value) = lookup("TILLER_COMMAND_INTERVAL_MS") {
            config.command_period = parse_millis("TILLER_COMMAND_INTERVAL_MS", value)?;
        }
        if let Some(value) = lookup("TILLER_CANDIDATE_LIMIT") {
            config.candidate_limit = match value.trim().parse::<usize>() {
                Ok(limit) if limit > 0 => limit,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "TILLER_CANDIDATE_LIMIT",
                        value,
                    })
                }
            };
        }
        Ok(config)
    }

    pub fn topics(&self) -> Topics {
        Topics::for_vehicle(&self.vehicle_id)
    }
}

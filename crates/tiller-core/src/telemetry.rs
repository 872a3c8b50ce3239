//! Folds vehicle telemetry records into a copy-on-write snapshot.
//!
//! Records arrive either as `key:value` text on a data channel or as
//! rendezvous messages whose topic ends in the key. Both forms are normalised
//! to [`TelemetryField`] before the snapshot is touched; unknown keys are
//! ignored.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, trace};

/// Value of every field before its first update.
pub const UNKNOWN: &str = "unknown";

const SOURCE_QUALIFIERS: [&str; 3] = ["stm32", "boat", "phone"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryField {
    BoatVoltage,
    BoatTacho,
    PhoneBattery,
    PhoneGps,
    PhoneSignal,
    PhoneNetworkType,
    PhoneCompass,
}

impl TelemetryField {
    pub const ALL: [TelemetryField; 7] = [
        TelemetryField::BoatVoltage,
        TelemetryField::BoatTacho,
        TelemetryField::PhoneBattery,
        TelemetryField::PhoneGps,
        TelemetryField::PhoneSignal,
        TelemetryField::PhoneNetworkType,
        TelemetryField::PhoneCompass,
    ];

    /// Maps a record key, optionally qualified by its source (`stm32:voltage`),
    /// onto a field.
    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_ascii_lowercase();
        let name = match key.split_once(':') {
            Some((source, name)) if SOURCE_QUALIFIERS.contains(&source) => name,
            Some(_) => return None,
            None => key.as_str(),
        };
        match name {
            "voltage" => Some(Self::BoatVoltage),
            "tacho" | "tachometer" | "rpm" => Some(Self::BoatTacho),
            "battery" => Some(Self::PhoneBattery),
            "gps" => Some(Self::PhoneGps),
            "signal" => Some(Self::PhoneSignal),
            "network-type" | "network_type" | "network" => Some(Self::PhoneNetworkType),
            "compass" | "heading" => Some(Self::PhoneCompass),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::BoatVoltage => "voltage",
            Self::BoatTacho => "tacho",
            Self::PhoneBattery => "battery",
            Self::PhoneGps => "gps",
            Self::PhoneSignal => "signal",
            Self::PhoneNetworkType => "network-type",
            Self::PhoneCompass => "compass",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub boat_voltage: String,
    pub boat_tacho: String,
    pub phone_battery: String,
    pub phone_gps: String,
    pub phone_signal: String,
    pub phone_network_type: String,
    pub phone_compass: String,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            boat_voltage: UNKNOWN.into(),
            boat_tacho: UNKNOWN.into(),
            phone_battery: UNKNOWN.into(),
            phone_gps: UNKNOWN.into(),
            phone_signal: UNKNOWN.into(),
            phone_network_type: UNKNOWN.into(),
            phone_compass: UNKNOWN.into(),
        }
    }
}

impl TelemetrySnapshot {
    pub fn get(&self, field: TelemetryField) -> &str {
        match field {
            TelemetryField::BoatVoltage => &self.boat_voltage,
            TelemetryField::BoatTacho => &self.boat_tacho,
            TelemetryField::PhoneBattery => &self.phone_battery,
            TelemetryField::PhoneGps => &self.phone_gps,
            TelemetryField::PhoneSignal => &self.phone_signal,
            TelemetryField::PhoneNetworkType => &self.phone_network_type,
            TelemetryField::PhoneCompass => &self.phone_compass,
        }
    }

    fn slot(&mut self, field: TelemetryField) -> &mut String {
        match field {
            TelemetryField::BoatVoltage => &mut self.boat_voltage,
            TelemetryField::BoatTacho => &mut self.boat_tacho,
            TelemetryField::PhoneBattery => &mut self.phone_battery,
            TelemetryField::PhoneGps => &mut self.phone_gps,
            TelemetryField::PhoneSignal => &mut self.phone_signal,
            TelemetryField::PhoneNetworkType => &mut self.phone_network_type,
            TelemetryField::PhoneCompass => &mut self.phone_compass,
        }
    }

    /// Copy of `self` with one field replaced.
    pub fn with(&self, field: TelemetryField, value: &str) -> Self {
        let mut next = self.clone();
        *next.slot(field) = value.to_string();
        next
    }
}

/// Splits a data-channel record into key and value, keeping a leading source
/// qualifier attached to the key.
fn split_record(record: &str) -> Option<(&str, &str)> {
    let (head, rest) = record.split_once(':')?;
    if SOURCE_QUALIFIERS.contains(&head.to_ascii_lowercase().as_str()) {
        if let Some((name, value)) = rest.split_once(':') {
            return Some((&record[..head.len() + 1 + name.len()], value));
        }
    }
    Some((head, rest))
}

#[derive(Debug)]
pub struct TelemetryRouter {
    snapshot: watch::Sender<Arc<TelemetrySnapshot>>,
}

impl Default for TelemetryRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryRouter {
    pub fn new() -> Self {
        Self {
            snapshot: watch::channel(Arc::new(TelemetrySnapshot::default())).0,
        }
    }

    pub fn snapshot(&self) -> Arc<TelemetrySnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TelemetrySnapshot>> {
        self.snapshot.subscribe()
    }

    /// Applies one keyed value. Returns false when the key is not part of the
    /// vocabulary.
    pub fn apply(&self, key: &str, value: &str) -> bool {
        let Some(field) = TelemetryField::from_key(key) else {
            debug!(target: "tiller::telemetry", key, "ignoring unknown telemetry key");
            return false;
        };
        self.snapshot.send_if_modified(|current| {
            if current.get(field) == value {
                return false;
            }
            *current = Arc::new(current.with(field, value));
            true
        });
        trace!(target: "tiller::telemetry", field = field.key(), value, "telemetry updated");
        true
    }

    /// Applies a `key:value` record received on a data channel.
    pub fn apply_record(&self, record: &str) -> bool {
        match split_record(record) {
            Some((key, value)) => self.apply(key, value),
            None => {
                debug!(target: "tiller::telemetry", len = record.len(), "telemetry record without key");
                false
            }
        }
    }

    /// Applies a rendezvous message whose topic's last segment is the key.
    pub fn apply_topic(&self, topic: &str, payload: &[u8]) -> bool {
        let key = topic.rsplit('/').next().unwrap_or(topic);
        match std::str::from_utf8(payload) {
            Ok(value) => self.apply(key, value),
            Err(err) => {
                debug!(target: "tiller::telemetry", topic, error = %err, "telemetry payload is not utf8");
                false
            }
        }
    }
}

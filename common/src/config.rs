use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::timeline::{Timeline, DAY_MS};
use crate::types::Channel;

pub const DEFAULT_POLL_SECONDS: u64 = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermostatConfig {
    /// Sensor identifier, e.g. a DS18x20 1-wire serial number.
    pub id: String,
    #[serde(default = "default_poll_every")]
    pub poll_every_s: u64,
    pub timeline: Timeline,
    #[serde(default)]
    pub history: Option<HistoryConfig>,
}

fn default_poll_every() -> u64 {
    DEFAULT_POLL_SECONDS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinConfig {
    pub gpio: u32,
    #[serde(default)]
    pub history: Option<HistoryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub file: PathBuf,
    #[serde(default = "default_history_interval")]
    pub interval_ms: u64,
    /// Set if sample events may be appended out of order.
    #[serde(default)]
    pub unordered: bool,
}

fn default_history_interval() -> u64 {
    300_000 // 5 minutes
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    pub name: String,
    pub file: PathBuf,
    #[serde(default = "default_calendar_update")]
    pub update_interval_s: u64,
}

fn default_calendar_update() -> u64 {
    6 * 60 * 60 // 6 hours
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub thermostats: BTreeMap<Channel, ThermostatConfig>,
    pub pins: BTreeMap<Channel, PinConfig>,
    #[serde(default)]
    pub calendars: Vec<CalendarConfig>,
    /// How long the mid-position valve takes to spring back once the
    /// grey wire is released.
    #[serde(default = "default_valve_return")]
    pub valve_return_ms: u64,
    #[serde(default = "default_rule_interval")]
    pub rule_interval_ms: u64,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub web_root: Option<PathBuf>,
    /// Simulated hardware instead of sysfs GPIO and 1-wire sensors.
    #[serde(default)]
    pub simulate: bool,
}

fn default_valve_return() -> u64 {
    8_000
}

fn default_rule_interval() -> u64 {
    5_000
}

fn default_http_port() -> u16 {
    8080
}

impl SystemConfig {
    pub fn validated(mut self) -> Result<Self, DomainError> {
        for channel in Channel::ALL {
            if !self.thermostats.contains_key(&channel) {
                return Err(DomainError::bad_request(
                    "thermostats",
                    format!("no thermostat configured for {channel}"),
                ));
            }
            if !self.pins.contains_key(&channel) {
                return Err(DomainError::bad_request(
                    "pins",
                    format!("no pin configured for {channel}"),
                ));
            }
        }
        for cfg in self.thermostats.values_mut() {
            cfg.timeline = cfg.timeline.clone().validated()?;
            if cfg.id.is_empty() {
                return Err(DomainError::bad_request("id", "sensor id must be non-empty"));
            }
            if cfg.poll_every_s == 0 {
                cfg.poll_every_s = DEFAULT_POLL_SECONDS;
            }
        }
        Ok(self)
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        let timeline = Timeline::new(0.0, 25.0, DAY_MS, Vec::new()).expect("static bounds");
        let thermostats = Channel::ALL
            .iter()
            .map(|&ch| {
                (
                    ch,
                    ThermostatConfig {
                        id: format!("sim-{}", ch.as_str()),
                        poll_every_s: DEFAULT_POLL_SECONDS,
                        timeline: timeline.clone(),
                        history: None,
                    },
                )
            })
            .collect();
        let pins = [(Channel::Ch, 23), (Channel::Hw, 25)]
            .into_iter()
            .map(|(ch, gpio)| (ch, PinConfig { gpio, history: None }))
            .collect();
        Self {
            thermostats,
            pins,
            calendars: Vec::new(),
            valve_return_ms: default_valve_return(),
            rule_interval_ms: default_rule_interval(),
            http_port: default_http_port(),
            web_root: None,
            simulate: true,
        }
    }
}

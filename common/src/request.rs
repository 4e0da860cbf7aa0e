use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DomainError;

/// `Boost` lives until the target is met. `Clear` is consumed on
/// arrival to delete a source's requests, never stored live.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Until {
    Boost,
    Clear,
    At(i64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetTemp {
    Off,
    Degrees(f64),
}

/// A time-boxed override of a thermostat's timeline, attributed to a
/// named source (browser, calendar, boost command).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub source: String,
    pub until: Until,
    pub temperature: TargetTemp,
}

impl Request {
    pub fn new(
        source: impl Into<String>,
        until: Until,
        temperature: TargetTemp,
    ) -> Result<Self, DomainError> {
        let source = source.into();
        if source.is_empty() {
            return Err(DomainError::bad_request("source", "must be non-empty"));
        }
        Ok(Self {
            source,
            until,
            temperature,
        })
    }
}

impl Until {
    /// Epoch ms (number or digit string), a date string, or
    /// case-insensitive `boost`/`clear`.
    pub fn parse(raw: &UntilWire) -> Result<Self, DomainError> {
        match raw {
            UntilWire::Epoch(ms) => Ok(Until::At(*ms)),
            UntilWire::Text(s) => {
                if s.eq_ignore_ascii_case("boost") {
                    return Ok(Until::Boost);
                }
                if s.eq_ignore_ascii_case("clear") {
                    return Ok(Until::Clear);
                }
                if let Ok(ms) = s.parse::<i64>() {
                    return Ok(Until::At(ms));
                }
                parse_date_ms(s)
                    .map(Until::At)
                    .ok_or_else(|| DomainError::bad_request("until", format!("bad time {s:?}")))
            }
        }
    }
}

impl TargetTemp {
    pub fn parse(raw: &TemperatureWire) -> Result<Self, DomainError> {
        match raw {
            TemperatureWire::Degrees(t) => Ok(TargetTemp::Degrees(*t)),
            TemperatureWire::Text(s) => {
                if s.eq_ignore_ascii_case("off") {
                    return Ok(TargetTemp::Off);
                }
                s.parse::<f64>().map(TargetTemp::Degrees).map_err(|_| {
                    DomainError::bad_request("temperature", format!("bad temperature {s:?}"))
                })
            }
        }
    }

    pub fn degrees(&self) -> Option<f64> {
        match self {
            TargetTemp::Degrees(t) => Some(*t),
            TargetTemp::Off => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UntilWire {
    Epoch(i64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TemperatureWire {
    Degrees(f64),
    Text(String),
}

fn parse_date_ms(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    // Bare timestamps without an offset are treated as UTC.
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?).timestamp_millis());
    }
    None
}

impl Serialize for Until {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Until::Boost => serializer.serialize_str("boost"),
            Until::Clear => serializer.serialize_str("clear"),
            Until::At(ms) => serializer.serialize_i64(*ms),
        }
    }
}

impl<'de> Deserialize<'de> for Until {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = UntilWire::deserialize(deserializer)?;
        Until::parse(&wire).map_err(D::Error::custom)
    }
}

impl Serialize for TargetTemp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TargetTemp::Off => serializer.serialize_str("off"),
            TargetTemp::Degrees(t) => serializer.serialize_f64(*t),
        }
    }
}

impl<'de> Deserialize<'de> for TargetTemp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = TemperatureWire::deserialize(deserializer)?;
        TargetTemp::parse(&wire).map_err(D::Error::custom)
    }
}

/// All present fields must match; an empty match matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMatch {
    pub source: Option<String>,
    pub until: Option<Until>,
    pub temperature: Option<TargetTemp>,
}

impl RequestMatch {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn by_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, req: &Request) -> bool {
        if let Some(source) = &self.source {
            if *source != req.source {
                return false;
            }
        }
        if let Some(until) = &self.until {
            if *until != req.until {
                return false;
            }
        }
        if let Some(temperature) = &self.temperature {
            if *temperature != req.temperature {
                return false;
            }
        }
        true
    }
}

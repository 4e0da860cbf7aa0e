use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Ch,
    Hw,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Ch, Channel::Hw];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ch => "CH",
            Self::Hw => "HW",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("CH") {
            Ok(Self::Ch)
        } else if s.eq_ignore_ascii_case("HW") {
            Ok(Self::Hw)
        } else {
            Err(DomainError::UnknownService(s.to_string()))
        }
    }
}

pub type PinLevel = u8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermostatStatus {
    pub temperature: f64,
    #[serde(rename = "lastKnownGood")]
    pub last_known_good: i64,
    pub target: f64,
    pub requests: Vec<Request>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinStatus {
    pub state: PinLevel,
    /// True while a valve release sequence is in flight.
    #[serde(rename = "pendingTransition")]
    pub pending: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub time: i64,
    pub thermostats: BTreeMap<Channel, ThermostatStatus>,
    pub pins: BTreeMap<Channel, PinStatus>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn channel_parses_case_insensitively() {
        assert_eq!("ch".parse::<Channel>().unwrap(), Channel::Ch);
        assert_eq!("HW".parse::<Channel>().unwrap(), Channel::Hw);
        assert!(matches!(
            "boiler".parse::<Channel>(),
            Err(DomainError::UnknownService(_))
        ));
    }

    #[test]
    fn channel_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Channel::Ch).unwrap(), "\"CH\"");
    }
}

pub mod config;
pub mod error;
pub mod request;
pub mod thermostat;
pub mod timeline;
pub mod trace;
pub mod types;

pub use config::{
    CalendarConfig, HistoryConfig, PinConfig, SystemConfig, ThermostatConfig,
    DEFAULT_POLL_SECONDS,
};
pub use error::DomainError;
pub use request::{Request, RequestMatch, TargetTemp, TemperatureWire, Until, UntilWire};
pub use thermostat::{ThermostatModel, NO_RESPONSE_ALARM_MS};
pub use timeline::{TimeValue, Timeline, DAY_MS};
pub use trace::{decode_trace, encode_trace, Sample};
pub use types::{Channel, PinLevel, PinStatus, SystemState, ThermostatStatus};

//! Hardware access: GPIO pins through the Linux sysfs interface and
//! DS18x20 temperature sensors through the 1-wire bus. Simulated
//! variants are selected once at construction when the config asks for
//! them, so the rest of the controller never needs to know which kind
//! it is talking to.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use tracing::debug;

use heating_common::PinLevel;

const GPIO_ROOT: &str = "/sys/class/gpio";
const ONE_WIRE_ROOT: &str = "/sys/bus/w1/devices";

#[derive(Debug, Clone)]
pub enum PinDriver {
    Sysfs(SysfsPin),
    Sim(SimPin),
}

impl PinDriver {
    /// Export the pin, set it as an output, and drive it low.
    pub async fn initialise(&self) -> anyhow::Result<()> {
        match self {
            Self::Sysfs(pin) => pin.initialise().await,
            Self::Sim(pin) => {
                pin.set(0).await;
                Ok(())
            }
        }
    }

    pub async fn get(&self) -> anyhow::Result<PinLevel> {
        match self {
            Self::Sysfs(pin) => pin.get().await,
            Self::Sim(pin) => Ok(pin.get()),
        }
    }

    pub async fn set(&self, level: PinLevel) -> anyhow::Result<()> {
        match self {
            Self::Sysfs(pin) => pin.set(level).await,
            Self::Sim(pin) => {
                pin.set(level).await;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SysfsPin {
    gpio: u32,
    root: PathBuf,
}

impl SysfsPin {
    pub fn new(gpio: u32) -> Self {
        Self {
            gpio,
            root: PathBuf::from(GPIO_ROOT),
        }
    }

    fn pin_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.gpio))
    }

    async fn initialise(&self) -> anyhow::Result<()> {
        if !self.pin_dir().exists() {
            tokio::fs::write(self.root.join("export"), self.gpio.to_string())
                .await
                .with_context(|| format!("failed to export gpio{}", self.gpio))?;
        }
        tokio::fs::write(self.pin_dir().join("direction"), "out")
            .await
            .with_context(|| format!("failed to set gpio{} direction", self.gpio))?;
        self.set(0).await
    }

    async fn get(&self) -> anyhow::Result<PinLevel> {
        let raw = tokio::fs::read_to_string(self.pin_dir().join("value"))
            .await
            .with_context(|| format!("failed to read gpio{}", self.gpio))?;
        match raw.trim() {
            "0" => Ok(0),
            "1" => Ok(1),
            other => Err(anyhow!("gpio{} reported bad value {other:?}", self.gpio)),
        }
    }

    async fn set(&self, level: PinLevel) -> anyhow::Result<()> {
        debug!("gpio{}={}", self.gpio, if level == 1 { "ON" } else { "OFF" });
        tokio::fs::write(self.pin_dir().join("value"), level.to_string())
            .await
            .with_context(|| format!("failed to write gpio{}", self.gpio))
    }
}

/// Journal of simulated pin writes, shared across pins so tests can
/// assert on the interleaved write order.
pub type PinJournal = Arc<Mutex<Vec<(String, PinLevel)>>>;

#[derive(Debug, Clone)]
pub struct SimPin {
    label: String,
    level: Arc<Mutex<PinLevel>>,
    journal: PinJournal,
}

impl SimPin {
    pub fn new(label: impl Into<String>, journal: PinJournal) -> Self {
        Self {
            label: label.into(),
            level: Arc::new(Mutex::new(0)),
            journal,
        }
    }

    pub fn get(&self) -> PinLevel {
        *self.level.lock().expect("sim pin lock")
    }

    pub async fn set(&self, level: PinLevel) {
        *self.level.lock().expect("sim pin lock") = level;
        self.journal
            .lock()
            .expect("sim journal lock")
            .push((self.label.clone(), level));
    }
}

#[derive(Debug, Clone)]
pub enum TempSensor {
    W1(W1Sensor),
    Sim(SimSensor),
}

impl TempSensor {
    /// Read the current temperature in celsius. Rejects on CRC failure
    /// or the 85C power-on-reset code.
    pub async fn read(&self) -> anyhow::Result<f64> {
        match self {
            Self::W1(sensor) => sensor.read().await,
            Self::Sim(sensor) => sensor.read(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct W1Sensor {
    id: String,
    root: PathBuf,
}

impl W1Sensor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            root: PathBuf::from(ONE_WIRE_ROOT),
        }
    }

    async fn read(&self) -> anyhow::Result<f64> {
        let path = self.root.join(&self.id).join("w1_slave");
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read sensor {}", self.id))?;
        parse_w1_slave(&content).map_err(|detail| anyhow!("sensor {}: {detail}", self.id))
    }
}

/// Parse the two-line w1_slave report. The first line ends in `YES`
/// when the CRC passed; the second carries `t=` followed by the
/// temperature in millidegrees.
fn parse_w1_slave(content: &str) -> Result<f64, String> {
    let mut lines = content.lines();
    let crc_line = lines.next().unwrap_or("");
    if !crc_line.trim_end().ends_with("YES") {
        return Err(format!("CRC check failed {content:?}"));
    }
    let data_line = lines.next().unwrap_or("");
    let raw = data_line
        .split_once("t=")
        .map(|(_, t)| t.trim())
        .ok_or_else(|| "format error, no t=".to_string())?;
    let millidegrees: f64 = raw
        .parse()
        .map_err(|_| format!("bad temperature {raw:?}"))?;
    // 85000 is the power-on reset value, which means the conversion
    // never ran.
    if millidegrees == 85_000.0 {
        return Err("error 85".to_string());
    }
    Ok(millidegrees / 1000.0)
}

/// In-memory sensor for tests and debug runs. The shared value can be
/// nudged from a test or by the debug API; `fail` makes reads reject.
#[derive(Debug, Clone)]
pub struct SimSensor {
    value: Arc<Mutex<f64>>,
    fail: Arc<AtomicBool>,
}

impl SimSensor {
    pub fn new(initial: f64) -> Self {
        Self {
            value: Arc::new(Mutex::new(initial)),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_value(&self, value: f64) {
        *self.value.lock().expect("sim sensor lock") = value;
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    fn read(&self) -> anyhow::Result<f64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("simulated sensor failure"));
        }
        Ok(*self.value.lock().expect("sim sensor lock"))
    }
}

impl W1Sensor {
    /// List the DS18x20 sensors visible on the 1-wire bus. Logged at
    /// startup so a misconfigured sensor id is easy to spot.
    pub async fn list() -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(ONE_WIRE_ROOT).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_sensor_id(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

fn is_sensor_id(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 15
        && bytes[2] == b'-'
        && name[..2].chars().all(|c| c.is_ascii_hexdigit())
        && name[3..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_good_w1_report() {
        let report = "6e 01 4b 46 7f ff 02 10 71 : crc=71 YES\n\
                      6e 01 4b 46 7f ff 02 10 71 t=22875\n";
        assert_eq!(parse_w1_slave(report).unwrap(), 22.875);
    }

    #[test]
    fn rejects_crc_failure() {
        let report = "6e 01 4b 46 7f ff 02 10 71 : crc=71 NO\n\
                      6e 01 4b 46 7f ff 02 10 71 t=22875\n";
        assert!(parse_w1_slave(report).unwrap_err().contains("CRC"));
    }

    #[test]
    fn rejects_power_on_reset_code() {
        let report = "00 : crc=00 YES\n00 t=85000\n";
        assert!(parse_w1_slave(report).unwrap_err().contains("85"));
    }

    #[test]
    fn rejects_missing_temperature() {
        assert!(parse_w1_slave("x YES\nx\n").is_err());
    }

    #[test]
    fn recognises_sensor_ids() {
        assert!(is_sensor_id("28-0316027f81ff"));
        assert!(!is_sensor_id("w1_bus_master1"));
    }

    #[tokio::test]
    async fn sim_pin_journals_writes() {
        let journal: PinJournal = Arc::new(Mutex::new(Vec::new()));
        let pin = SimPin::new("CH", journal.clone());
        pin.set(1).await;
        pin.set(0).await;
        assert_eq!(pin.get(), 0);
        assert_eq!(
            *journal.lock().unwrap(),
            vec![("CH".to_string(), 1), ("CH".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn sim_sensor_fails_on_demand() {
        let sensor = SimSensor::new(20.0);
        assert_eq!(sensor.read().unwrap(), 20.0);
        sensor.set_failing(true);
        assert!(sensor.read().is_err());
        sensor.set_failing(false);
        sensor.set_value(21.5);
        assert_eq!(sensor.read().unwrap(), 21.5);
    }
}

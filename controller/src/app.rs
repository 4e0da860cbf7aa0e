//! System assembly: configuration store, service directory, hardware
//! bring-up and task spawning.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

use heating_common::{
    Channel, DomainError, PinStatus, Request, RequestMatch, SystemConfig, SystemState, Until,
};

use crate::calendar::{spawn_calendar_loop, Calendar};
use crate::clock::now_ms;
use crate::hardware::{PinDriver, SimPin, SimSensor, SysfsPin, TempSensor, W1Sensor};
use crate::history::{spawn_sampler, Historian};
use crate::rules::spawn_rule_loop;
use crate::server;
use crate::thermostat::{spawn_poll_loop, ThermostatService};
use crate::valve::{Pin, ValveController};

/// Temperature assumed for a thermostat whose sensor never answered at
/// startup. High enough that the rules keep everything off until the
/// hardware thermostats have had a chance to report.
const UNKNOWN_TEMPERATURE: f64 = 100.0;

/// Named lookup of thermostat services, shared by the HTTP API and the
/// calendars. `"ALL"` fans out to every service.
pub struct ServiceMap {
    thermostats: BTreeMap<Channel, Arc<ThermostatService>>,
}

impl ServiceMap {
    pub fn new(thermostats: BTreeMap<Channel, Arc<ThermostatService>>) -> Self {
        Self { thermostats }
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<ThermostatService>> {
        self.thermostats.get(&channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Channel, &Arc<ThermostatService>)> {
        self.thermostats.iter()
    }

    pub fn resolve(
        &self,
        service: &str,
    ) -> Result<Vec<Arc<ThermostatService>>, DomainError> {
        if service.eq_ignore_ascii_case("ALL") {
            return Ok(self.thermostats.values().cloned().collect());
        }
        let channel = Channel::from_str(service)
            .map_err(|_| DomainError::UnknownService(service.to_string()))?;
        self.thermostats
            .get(&channel)
            .cloned()
            .map(|t| vec![t])
            .ok_or_else(|| DomainError::UnknownService(service.to_string()))
    }

    /// A `clear` request withdraws that source's requests instead of
    /// being stored.
    pub async fn make_request(&self, service: &str, req: Request) -> Result<(), DomainError> {
        let targets = self.resolve(service)?;
        if req.until == Until::Clear {
            let matcher = RequestMatch::by_source(req.source.as_str());
            for thermostat in targets {
                thermostat.purge_requests(&matcher, true).await;
            }
            return Ok(());
        }
        for thermostat in targets {
            thermostat.add_request(req.clone()).await;
        }
        Ok(())
    }

    pub async fn purge_requests(
        &self,
        service: &str,
        matcher: &RequestMatch,
        force: bool,
    ) -> usize {
        let Ok(targets) = self.resolve(service) else {
            return 0;
        };
        let mut purged = 0;
        for thermostat in targets {
            purged += thermostat.purge_requests(matcher, force).await;
        }
        purged
    }
}

/// JSON configuration file with a write lock, also the persistence
/// target for timeline edits.
pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> anyhow::Result<SystemConfig> {
        let _guard = self.lock.lock().await;
        let config = match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice::<SystemConfig>(&raw)
                .with_context(|| format!("bad JSON in {}", self.path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no config at {}, using defaults", self.path.display());
                SystemConfig::default()
            }
            Err(err) => return Err(err.into()),
        };
        config
            .validated()
            .with_context(|| format!("invalid config in {}", self.path.display()))
    }

    pub async fn save(&self, config: &SystemConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let payload = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(&self.path, payload).await?;
        Ok(())
    }
}

pub struct HeatingSystem {
    config: Mutex<SystemConfig>,
    store: ConfigStore,
    services: Arc<ServiceMap>,
    valve: Arc<ValveController>,
    calendars: Vec<Arc<Calendar>>,
    stop: Arc<AtomicBool>,
}

impl HeatingSystem {
    pub fn build(config: SystemConfig, store: ConfigStore) -> anyhow::Result<Arc<Self>> {
        let mut thermostats = BTreeMap::new();
        for (&channel, cfg) in &config.thermostats {
            let sensor = if config.simulate {
                TempSensor::Sim(SimSensor::new(20.0))
            } else {
                TempSensor::W1(W1Sensor::new(cfg.id.clone()))
            };
            let history = cfg
                .history
                .clone()
                .map(|h| Arc::new(Historian::new(channel.as_str(), h)));
            thermostats.insert(
                channel,
                Arc::new(ThermostatService::new(
                    channel,
                    sensor,
                    Duration::from_secs(cfg.poll_every_s),
                    cfg.timeline.clone(),
                    history,
                )),
            );
        }
        let services = Arc::new(ServiceMap::new(thermostats));

        let journal = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pins = BTreeMap::new();
        for (&channel, cfg) in &config.pins {
            let driver = if config.simulate {
                PinDriver::Sim(SimPin::new(channel.as_str(), journal.clone()))
            } else {
                PinDriver::Sysfs(SysfsPin::new(cfg.gpio))
            };
            let history = cfg
                .history
                .clone()
                .map(|h| Arc::new(Historian::new(channel.as_str(), h)));
            pins.insert(channel, Arc::new(Pin::new(channel, driver, history)));
        }
        let valve = Arc::new(ValveController::new(
            pins,
            Duration::from_millis(config.valve_return_ms),
        ));

        let calendars = config
            .calendars
            .iter()
            .map(|c| Arc::new(Calendar::new(c.clone(), services.clone())))
            .collect();

        Ok(Arc::new(Self {
            store,
            services,
            valve,
            calendars,
            stop: Arc::new(AtomicBool::new(false)),
            config: Mutex::new(config),
        }))
    }

    pub fn services(&self) -> &Arc<ServiceMap> {
        &self.services
    }

    pub fn valve(&self) -> &Arc<ValveController> {
        &self.valve
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let (rule_interval, simulate) = {
            let config = self.config.lock().await;
            (
                Duration::from_millis(config.rule_interval_ms),
                config.simulate,
            )
        };
        if simulate {
            info!("running against simulated hardware");
        } else {
            match W1Sensor::list().await {
                Ok(ids) => info!("1-wire sensors present: {ids:?}"),
                Err(err) => warn!("could not scan the 1-wire bus: {err}"),
            }
        }

        for channel in Channel::ALL {
            self.valve.pin(channel).initialise().await?;
        }
        // Reset failure is already logged; polling and rules still run
        // so a transient GPIO error does not take the system down.
        let _ = self.valve.reset().await;

        for (_, thermostat) in self.services.iter() {
            thermostat.prime(UNKNOWN_TEMPERATURE).await;
        }

        for (_, thermostat) in self.services.iter() {
            spawn_poll_loop(thermostat.clone(), self.stop.clone());
            if let Some(history) = thermostat.history() {
                let cell = thermostat.latest_cell();
                spawn_sampler(
                    history.clone(),
                    move || *cell.lock().expect("latest sample lock"),
                    self.stop.clone(),
                );
            }
        }

        for calendar in &self.calendars {
            spawn_calendar_loop(calendar.clone(), self.stop.clone());
        }

        spawn_rule_loop(
            self.services.iter().map(|(&c, t)| (c, t.clone())).collect(),
            self.valve.clone(),
            rule_interval,
            self.stop.clone(),
        );
        Ok(())
    }

    /// Stop all periodic tasks. Idempotent; in-flight work observes
    /// the flag and lapses.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            info!("stopping");
        }
    }

    pub async fn state(&self) -> anyhow::Result<SystemState> {
        let mut thermostats = BTreeMap::new();
        for (&channel, thermostat) in self.services.iter() {
            thermostats.insert(channel, thermostat.status().await);
        }
        let mut pins = BTreeMap::new();
        for channel in Channel::ALL {
            let status = self.valve.status(channel).await.unwrap_or_else(|err| {
                warn!("{channel} state read failed: {err:#}");
                PinStatus {
                    state: 0,
                    pending: self.valve.is_pending(),
                    reason: format!("state unknown: {err:#}"),
                }
            });
            pins.insert(channel, status);
        }
        Ok(SystemState {
            time: now_ms(),
            thermostats,
            pins,
        })
    }

    pub async fn set_timeline(
        &self,
        channel: Channel,
        timeline: heating_common::Timeline,
    ) -> anyhow::Result<()> {
        let thermostat = self
            .services
            .get(channel)
            .ok_or_else(|| DomainError::UnknownService(channel.to_string()))?;
        thermostat.set_timeline(timeline.clone()).await;
        let config = {
            let mut config = self.config.lock().await;
            if let Some(cfg) = config.thermostats.get_mut(&channel) {
                cfg.timeline = timeline;
            }
            config.clone()
        };
        self.store.save(&config).await
    }
}

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HEATING_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("heating.json"))
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new(config_path());
    let config = store.load().await?;
    let port = config.http_port;
    let web_root = config.web_root.clone();

    let system = HeatingSystem::build(config, store)?;
    system.start().await?;

    let app = server::router(system.clone(), web_root);
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("bad listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind server at {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to install signal handler: {err}");
            }
        })
        .await?;

    system.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use heating_common::TargetTemp;

    use super::*;

    fn simulated_system() -> Arc<HeatingSystem> {
        static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "heating-app-{}-{n}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        HeatingSystem::build(SystemConfig::default(), ConfigStore::new(path)).unwrap()
    }

    #[tokio::test]
    async fn request_routing_fans_out_all() {
        let system = simulated_system();
        let req = Request::new("test", Until::Boost, TargetTemp::Degrees(22.0)).unwrap();
        system.services().make_request("all", req).await.unwrap();
        for (_, thermostat) in system.services().iter() {
            let status = thermostat.status().await;
            assert_eq!(status.requests.len(), 1);
        }
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let system = simulated_system();
        let req = Request::new("test", Until::Boost, TargetTemp::Degrees(22.0)).unwrap();
        let err = system
            .services()
            .make_request("garage", req)
            .await
            .unwrap_err();
        assert_eq!(err, DomainError::UnknownService("garage".to_string()));
    }

    #[tokio::test]
    async fn clear_request_withdraws_by_source() {
        let system = simulated_system();
        let services = system.services();
        let req = Request::new("test", Until::At(i64::MAX), TargetTemp::Degrees(22.0)).unwrap();
        services.make_request("CH", req).await.unwrap();

        let clear = Request::new("test", Until::Clear, TargetTemp::Off).unwrap();
        services.make_request("CH", clear).await.unwrap();
        let status = services.get(Channel::Ch).unwrap().status().await;
        assert!(status.requests.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_resets_valve_and_runs_rules() {
        let system = simulated_system();
        system.start().await.unwrap();
        // Let the reset sequence and the first rule tick run.
        tokio::time::sleep(Duration::from_secs(30)).await;
        let state = system.state().await.unwrap();
        assert_eq!(state.thermostats.len(), 2);
        assert_eq!(state.pins.len(), 2);
        system.stop();
        assert!(system.is_stopped());
    }

    #[tokio::test]
    async fn missing_config_file_loads_defaults() {
        let store = ConfigStore::new(std::env::temp_dir().join("heating-no-such-config.json"));
        let config = store.load().await.unwrap();
        assert!(config.simulate);
    }
}

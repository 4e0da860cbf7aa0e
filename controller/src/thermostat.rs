//! Per-channel thermostat service: owns the sensor, polls it on a
//! timer, and feeds samples into the pure model in `heating_common`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use heating_common::{
    Channel, Request, RequestMatch, ThermostatModel, ThermostatStatus, Timeline,
};

use crate::clock::{day_offset_ms, now_ms};
use crate::hardware::TempSensor;
use crate::history::Historian;

pub struct ThermostatService {
    channel: Channel,
    sensor: TempSensor,
    poll_every: Duration,
    model: Mutex<ThermostatModel>,
    /// Most recent good sample, mirrored outside the model lock so the
    /// history sampler can read it without awaiting.
    latest: Arc<StdMutex<f64>>,
    history: Option<Arc<Historian>>,
}

impl ThermostatService {
    pub fn new(
        channel: Channel,
        sensor: TempSensor,
        poll_every: Duration,
        timeline: Timeline,
        history: Option<Arc<Historian>>,
    ) -> Self {
        Self {
            channel,
            sensor,
            poll_every,
            model: Mutex::new(ThermostatModel::new(channel.as_str(), timeline, now_ms())),
            latest: Arc::new(StdMutex::new(0.0)),
            history,
        }
    }

    pub fn history(&self) -> Option<&Arc<Historian>> {
        self.history.as_ref()
    }

    pub fn latest_cell(&self) -> Arc<StdMutex<f64>> {
        self.latest.clone()
    }

    pub async fn temperature(&self) -> f64 {
        self.model.lock().await.temperature()
    }

    /// Initial read at startup. If the sensor is not answering, seed
    /// the model with `fallback` so the rules see a defined value
    /// until real samples arrive.
    pub async fn prime(&self, fallback: f64) {
        match self.sensor.read().await {
            Ok(temperature) => {
                self.model.lock().await.record_sample(temperature, now_ms());
                *self.latest.lock().expect("latest sample lock") = temperature;
            }
            Err(err) => {
                warn!(
                    "{} sensor not answering, assuming {fallback}C: {err:#}",
                    self.channel
                );
                self.model.lock().await.record_sample(fallback, now_ms());
                *self.latest.lock().expect("latest sample lock") = fallback;
            }
        }
    }

    /// Read the sensor once and record the outcome. A failed read only
    /// raises an alert once the sensor has been silent for longer than
    /// the no-response alarm window.
    pub async fn poll_once(&self) {
        match self.sensor.read().await {
            Ok(temperature) => {
                debug!("{}: {temperature}C", self.channel);
                self.model.lock().await.record_sample(temperature, now_ms());
                *self.latest.lock().expect("latest sample lock") = temperature;
            }
            Err(err) => {
                debug!("{} sensor read failed: {err:#}", self.channel);
                if let Some(alert) = self.model.lock().await.sample_failed(now_ms()) {
                    warn!("{alert}");
                }
            }
        }
    }

    pub async fn target_temperature(&self) -> f64 {
        self.model
            .lock()
            .await
            .target_temperature(now_ms(), day_offset_ms())
    }

    pub async fn maximum_temperature(&self) -> f64 {
        self.model.lock().await.maximum_temperature()
    }

    pub async fn add_request(&self, req: Request) {
        info!("{} request {req:?}", self.channel);
        self.model.lock().await.add_request(req);
    }

    pub async fn purge_requests(&self, matcher: &RequestMatch, force: bool) -> usize {
        self.model.lock().await.purge_requests(matcher, force, now_ms())
    }

    pub async fn status(&self) -> ThermostatStatus {
        self.model
            .lock()
            .await
            .serialisable_state(now_ms(), day_offset_ms())
    }

    pub async fn timeline(&self) -> Timeline {
        self.model.lock().await.timeline.clone()
    }

    pub async fn set_timeline(&self, timeline: Timeline) {
        info!("{} timeline replaced", self.channel);
        self.model.lock().await.timeline = timeline;
    }
}

/// Poll the sensor on the configured interval until `stop` flips.
pub fn spawn_poll_loop(
    service: Arc<ThermostatService>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(service.poll_every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if stop.load(Ordering::SeqCst) {
                debug!("{} polling stopped", service.channel);
                return;
            }
            service.poll_once().await;
        }
    })
}

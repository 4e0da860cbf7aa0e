//! Heating rules. Each channel compares the measured temperature
//! against the live target with a per-channel precision band and asks
//! the valve controller for the matching pin state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use heating_common::Channel;

use crate::thermostat::ThermostatService;
use crate::valve::ValveController;

/// Switching hysteresis in degrees. Water in the cylinder stratifies,
/// so hot water tolerates a much wider band than room air.
fn precision(channel: Channel) -> f64 {
    match channel {
        Channel::Hw => 2.0,
        Channel::Ch => 0.5,
    }
}

/// One evaluation of a channel's rule. Returns the pin state it
/// settled on, for tests.
pub async fn evaluate(
    channel: Channel,
    thermostat: &ThermostatService,
    valve: &ValveController,
) -> anyhow::Result<u8> {
    let temperature = thermostat.temperature().await;
    let maximum = thermostat.maximum_temperature().await;
    if temperature > maximum {
        // Overheat cutoff, regardless of any request.
        valve.pin(channel).set_reason(&format!(
            "{temperature}C is above the maximum {maximum}C"
        ));
        valve.set_pin_state(channel, 0).await?;
        return Ok(0);
    }

    let target = thermostat.target_temperature().await;
    if temperature > target {
        valve
            .pin(channel)
            .set_reason(&format!("{temperature}C is above target {target}C"));
        valve.set_pin_state(channel, 0).await?;
        return Ok(0);
    }
    if temperature < target - precision(channel) {
        valve
            .pin(channel)
            .set_reason(&format!("{temperature}C is below target {target}C"));
        valve.set_pin_state(channel, 1).await?;
        return Ok(1);
    }
    // Inside the hysteresis band, leave the pin where it is.
    valve.pin(channel).get_state().await
}

/// Re-evaluate all channels on a fixed interval until `stop` flips.
pub fn spawn_rule_loop(
    thermostats: BTreeMap<Channel, Arc<ThermostatService>>,
    valve: Arc<ValveController>,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if stop.load(Ordering::SeqCst) {
                debug!("rule loop stopped");
                return;
            }
            for (&channel, thermostat) in &thermostats {
                if let Err(err) = evaluate(channel, thermostat, &valve).await {
                    warn!("{channel} rule failed: {err:#}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use heating_common::{
        Request, TargetTemp, TimeValue, Timeline, Until, DAY_MS,
    };

    use crate::hardware::{PinDriver, PinJournal, SimPin, SimSensor, TempSensor};
    use crate::valve::Pin;

    use super::*;

    fn fixture(sensor_value: f64) -> (SimSensor, ThermostatService, ValveController) {
        let sensor = SimSensor::new(sensor_value);
        // Flat 20C schedule.
        let timeline = Timeline::new(
            0.0,
            25.0,
            DAY_MS,
            vec![TimeValue::new(0, 20.0)],
        )
        .unwrap();
        let thermostat = ThermostatService::new(
            Channel::Ch,
            TempSensor::Sim(sensor.clone()),
            Duration::from_secs(20),
            timeline,
            None,
        );
        let journal: PinJournal = Arc::new(Mutex::new(Vec::new()));
        let pins = Channel::ALL
            .iter()
            .map(|&ch| {
                (
                    ch,
                    Arc::new(Pin::new(
                        ch,
                        PinDriver::Sim(SimPin::new(ch.as_str(), journal.clone())),
                        None,
                    )),
                )
            })
            .collect();
        let valve = ValveController::new(pins, Duration::from_millis(1));
        (sensor, thermostat, valve)
    }

    #[tokio::test]
    async fn cold_room_turns_heating_on() {
        let (_sensor, thermostat, valve) = fixture(15.0);
        thermostat.poll_once().await;
        let state = evaluate(Channel::Ch, &thermostat, &valve).await.unwrap();
        assert_eq!(state, 1);
        assert_eq!(valve.pin(Channel::Ch).get_state().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn warm_room_turns_heating_off() {
        let (sensor, thermostat, valve) = fixture(15.0);
        thermostat.poll_once().await;
        evaluate(Channel::Ch, &thermostat, &valve).await.unwrap();

        // Drop the target to 18 and warm past it, but stay under the
        // schedule maximum.
        thermostat
            .add_request(
                Request::new("test", Until::At(i64::MAX), TargetTemp::Degrees(18.0)).unwrap(),
            )
            .await;
        sensor.set_value(19.0);
        thermostat.poll_once().await;
        let state = evaluate(Channel::Ch, &thermostat, &valve).await.unwrap();
        assert_eq!(state, 0);
        assert!(valve
            .status(Channel::Ch)
            .await
            .unwrap()
            .reason
            .contains("above target"));
    }

    #[tokio::test]
    async fn hysteresis_band_holds_state() {
        let (sensor, thermostat, valve) = fixture(15.0);
        thermostat.poll_once().await;
        evaluate(Channel::Ch, &thermostat, &valve).await.unwrap();

        // 19.7 is within 0.5 of a 20.0 target, so no transition.
        sensor.set_value(19.7);
        thermostat.poll_once().await;
        let state = evaluate(Channel::Ch, &thermostat, &valve).await.unwrap();
        assert_eq!(state, 1);
    }

    #[tokio::test]
    async fn overheat_wins_over_boost() {
        let (sensor, thermostat, valve) = fixture(15.0);
        thermostat
            .add_request(Request::new("test", Until::Boost, TargetTemp::Degrees(24.0)).unwrap())
            .await;
        sensor.set_value(26.0);
        thermostat.poll_once().await;
        let state = evaluate(Channel::Ch, &thermostat, &valve).await.unwrap();
        assert_eq!(state, 0);
        assert!(valve
            .status(Channel::Ch)
            .await
            .unwrap()
            .reason
            .contains("maximum"));
    }
}

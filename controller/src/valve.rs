//! Y-plan valve state machine. Two binary outputs, CH and HW, drive a
//! motorized 3-port valve with a spring return. The HW signal (the grey
//! wire) doubles as the valve-release path for CH: turning CH off while
//! HW is off leaves the grey wire held high and stalls the valve motor
//! against the spring. The controller detects that exact transition and
//! interjects a temporary HW pulse so the spring can discharge.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use heating_common::{Channel, PinLevel, PinStatus};

use crate::hardware::PinDriver;
use crate::history::Historian;

/// One named valve pin with its state history and the human-readable
/// reason for its current state.
#[derive(Debug)]
pub struct Pin {
    channel: Channel,
    driver: PinDriver,
    reason: StdMutex<String>,
    history: Option<Arc<Historian>>,
}

impl Pin {
    pub fn new(channel: Channel, driver: PinDriver, history: Option<Arc<Historian>>) -> Self {
        Self {
            channel,
            driver,
            reason: StdMutex::new(String::new()),
            history,
        }
    }

    pub async fn initialise(&self) -> anyhow::Result<()> {
        self.driver
            .initialise()
            .await
            .with_context(|| format!("pin {} initialisation failed", self.channel))
    }

    pub async fn get_state(&self) -> anyhow::Result<PinLevel> {
        self.driver.get().await
    }

    /// Don't call this directly on a Y-plan system; use
    /// [`ValveController::set_pin_state`], which respects the
    /// relationship between the two pins.
    pub async fn set_state(&self, level: PinLevel) -> anyhow::Result<()> {
        debug!("{}={}", self.channel, if level == 1 { "ON" } else { "OFF" });
        self.driver.set(level).await?;
        if let Some(history) = &self.history {
            history.record(level as f64, None).await?;
        }
        Ok(())
    }

    pub fn set_reason(&self, reason: &str) {
        *self.reason.lock().expect("pin reason lock") = reason.to_string();
    }

    pub fn reason(&self) -> String {
        self.reason.lock().expect("pin reason lock").clone()
    }

    pub fn history(&self) -> Option<&Arc<Historian>> {
        self.history.as_ref()
    }
}

/// Clears the pending flag when dropped, so a failed pin write in the
/// middle of the release sequence can never leave it latched.
struct PendingGuard<'a>(&'a AtomicBool);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ValveController {
    pins: BTreeMap<Channel, Arc<Pin>>,
    valve_return: Duration,
    /// Single-slot mutex over the CH/HW pin pair: true while a release
    /// pulse is in flight. Overlapping callers retry after
    /// `valve_return` rather than blocking.
    pending: AtomicBool,
}

impl ValveController {
    pub fn new(pins: BTreeMap<Channel, Arc<Pin>>, valve_return: Duration) -> Self {
        Self {
            pins,
            valve_return,
            pending: AtomicBool::new(false),
        }
    }

    pub fn pin(&self, channel: Channel) -> &Arc<Pin> {
        &self.pins[&channel]
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn status(&self, channel: Channel) -> anyhow::Result<PinStatus> {
        let pin = self.pin(channel);
        Ok(PinStatus {
            state: pin.get_state().await?,
            pending: self.is_pending(),
            reason: pin.reason(),
        })
    }

    /// Reset the pins to a known state on startup. Assumes worst case
    /// (grey wire live, valve mid-travel): force HW on to discharge the
    /// spring, wait for the valve to return, then drive everything off.
    pub async fn reset(&self) -> anyhow::Result<()> {
        info!("resetting valve");
        let result = async {
            self.pin(Channel::Hw).set_state(1).await?;
            tokio::time::sleep(self.valve_return).await;
            self.pin(Channel::Ch).set_state(0).await?;
            self.pin(Channel::Hw).set_state(0).await
        }
        .await;
        match result {
            Ok(()) => {
                info!("valve reset");
                Ok(())
            }
            Err(err) => {
                warn!("failed to reset valve: {err:#}");
                Err(err)
            }
        }
    }

    /// Set the on/off state of a channel, suitable for calling from
    /// rules. More involved than a raw pin write because of the Y-plan
    /// relationship between the two pins.
    pub async fn set_pin_state(&self, channel: Channel, new_state: PinLevel) -> anyhow::Result<()> {
        loop {
            // Serialize with any in-flight release sequence by
            // cooperative retry after the settling time.
            while self.pending.load(Ordering::SeqCst) {
                debug!("{channel} transition deferred, release in flight");
                tokio::time::sleep(self.valve_return).await;
            }

            let pin = self.pin(channel);
            let cur_state = pin.get_state().await?;
            if cur_state == new_state {
                return Ok(()); // already in the right state
            }

            if channel == Channel::Ch && cur_state == 1 && new_state == 0 {
                let hw = self.pin(Channel::Hw);
                if hw.get_state().await? != 0 {
                    // HW is on, so the grey wire is already managed;
                    // just turn CH off.
                    return pin.set_state(0).await;
                }

                // Grey live and white live: pulse HW so the spring can
                // return while CH goes off.
                if self
                    .pending
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    // Someone else started a release since we checked.
                    continue;
                }
                let _guard = PendingGuard(&self.pending);
                pin.set_state(0).await?;
                hw.set_state(1).await?;
                tokio::time::sleep(self.valve_return).await;
                return hw.set_state(0).await;
            }

            // Simple transition, a single pin write.
            return pin.set_state(new_state).await;
        }
    }
}

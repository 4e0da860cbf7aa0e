use crate::request::{Request, RequestMatch, TargetTemp, Until};
use crate::timeline::Timeline;
use crate::types::ThermostatStatus;

/// Alert once per silence episode after this long without a reading.
pub const NO_RESPONSE_ALARM_MS: i64 = 10 * 60 * 1000;

/// One thermostat: its timeline, live override requests and last
/// sample. Synchronous, times passed in. Where two sources request
/// different targets the most recently added wins, with boost and off
/// short-circuiting ahead of recency.
#[derive(Debug, Clone)]
pub struct ThermostatModel {
    name: String,
    pub timeline: Timeline,
    requests: Vec<Request>,
    temperature: f64,
    last_known_good: i64,
    alerted: bool,
}

impl ThermostatModel {
    pub fn new(name: impl Into<String>, timeline: Timeline, now_ms: i64) -> Self {
        Self {
            name: name.into(),
            timeline,
            requests: Vec::new(),
            temperature: 0.0,
            last_known_good: now_ms,
            alerted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn last_known_good(&self) -> i64 {
        self.last_known_good
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn record_sample(&mut self, temperature: f64, now_ms: i64) {
        self.temperature = temperature;
        self.last_known_good = now_ms;
        self.alerted = false;
    }

    /// Returns an alert message the first time the silence window is
    /// exceeded; the latch resets on the next good sample.
    pub fn sample_failed(&mut self, now_ms: i64) -> Option<String> {
        let waiting = now_ms - self.last_known_good;
        if self.alerted || waiting < NO_RESPONSE_ALARM_MS {
            return None;
        }
        self.alerted = true;
        Some(format!(
            "{} sensor has had no reading for {}s",
            self.name,
            waiting / 1000
        ))
    }

    // At most one live request per source.
    pub fn add_request(&mut self, req: Request) {
        self.purge_requests(&RequestMatch::by_source(req.source.as_str()), true, 0);
        self.requests.push(req);
    }

    /// Drop requests that have timed out or been satisfied, or (with
    /// `force`) everything the matcher selects.
    pub fn purge_requests(&mut self, matcher: &RequestMatch, force: bool, now_ms: i64) -> usize {
        let temperature = self.temperature;
        let before = self.requests.len();
        self.requests.retain(|req| {
            if !matcher.matches(req) {
                return true;
            }
            if force {
                return false;
            }
            match req.until {
                // A boost expires once the measured temperature reaches
                // its target.
                Until::Boost => match req.temperature.degrees() {
                    Some(target) => temperature < target,
                    None => true,
                },
                Until::At(until) => until >= now_ms,
                // Clear is consumed on arrival, never live.
                Until::Clear => false,
            }
        });
        before - self.requests.len()
    }

    /// `day_ms` is now minus local midnight, for the timeline lookup.
    pub fn target_temperature(&mut self, now_ms: i64, day_ms: u64) -> f64 {
        self.purge_requests(&RequestMatch::any(), false, now_ms);
        if !self.requests.is_empty() {
            for req in self.requests.iter().rev() {
                if req.until == Until::Boost {
                    // The most recent boost wins outright.
                    if let Some(t) = req.temperature.degrees() {
                        return t;
                    }
                }
                if req.temperature == TargetTemp::Off {
                    // Off forces the channel to never call for heat.
                    return self.timeline.lowest_value();
                }
            }
            // Otherwise the most recently added request.
            if let Some(t) = self
                .requests
                .last()
                .and_then(|req| req.temperature.degrees())
            {
                return t;
            }
        }
        self.timeline.value_at(day_ms).unwrap_or(0.0)
    }

    /// The highest temperature the timeline allows or any live request
    /// promises. Bounds overheat even while boosting.
    pub fn maximum_temperature(&self) -> f64 {
        let mut max = self.timeline.highest_value();
        for req in &self.requests {
            if let Some(t) = req.temperature.degrees() {
                if t > max {
                    max = t;
                }
            }
        }
        max
    }

    // Purges first so stale requests never leak into a response.
    pub fn serialisable_state(&mut self, now_ms: i64, day_ms: u64) -> ThermostatStatus {
        let target = self.target_temperature(now_ms, day_ms);
        ThermostatStatus {
            temperature: self.temperature,
            last_known_good: self.last_known_good,
            target,
            requests: self.requests.clone(),
        }
    }
}

//! File-backed calendar. A JSON file of events is reloaded on a timer;
//! each live or future event is armed with begin and end timers that
//! push a request when the event opens and purge it when it closes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use heating_common::{
    Request, RequestMatch, TargetTemp, TemperatureWire, Until, UntilWire,
};

use crate::app::ServiceMap;
use crate::clock::now_ms;

/// An event as it appears in the calendar file. The body is either
/// free text (`"CH BOOST 18"`, `"hw=50; ch=20"`, `"all off"`) or an
/// explicit service and temperature pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub start: UntilWire,
    #[serde(alias = "until")]
    pub end: UntilWire,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub temperature: Option<TemperatureWire>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEvent {
    pub id: String,
    pub service: String,
    pub start: i64,
    pub end: i64,
    pub request: Request,
}

pub struct Calendar {
    name: String,
    file: std::path::PathBuf,
    update_interval: Duration,
    services: Arc<ServiceMap>,
    /// Bumped on every reload; armed timers from older generations
    /// observe the bump and lapse without firing.
    generation: AtomicU64,
    schedule: Mutex<Vec<ScheduledEvent>>,
}

impl Calendar {
    pub fn new(config: heating_common::CalendarConfig, services: Arc<ServiceMap>) -> Self {
        Self {
            name: config.name,
            file: config.file,
            update_interval: Duration::from_secs(config.update_interval_s),
            services,
            generation: AtomicU64::new(0),
            schedule: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn schedule(&self) -> Vec<ScheduledEvent> {
        self.schedule.lock().await.clone()
    }

    /// Reload the event file and re-arm timers. A load failure keeps
    /// the previously armed schedule.
    pub async fn reload(self: &Arc<Self>) {
        let events = match self.load().await {
            Ok(events) => events,
            Err(err) => {
                warn!("calendar {}: reload failed, keeping schedule: {err:#}", self.name);
                return;
            }
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("calendar {}: {} live events", self.name, events.len());
        let previous = std::mem::replace(&mut *self.schedule.lock().await, events.clone());

        // An event deleted while live has already delivered its
        // request; withdraw it, or a cancelled boost would keep heat
        // called until the target was reached.
        let now = now_ms();
        for old in previous {
            let kept = events
                .iter()
                .any(|e| e.id == old.id && e.service == old.service);
            if !kept && old.start <= now {
                debug!("calendar {}: event {} removed, purging", self.name, old.id);
                self.services
                    .purge_requests(
                        &old.service,
                        &RequestMatch::by_source(old.request.source.as_str()),
                        true,
                    )
                    .await;
            }
        }

        for event in events {
            self.arm(event, generation);
        }
    }

    async fn load(&self) -> anyhow::Result<Vec<ScheduledEvent>> {
        let raw = tokio::fs::read_to_string(&self.file)
            .await
            .with_context(|| format!("failed to read {}", self.file.display()))?;
        let raw: Vec<RawEvent> =
            serde_json::from_str(&raw).with_context(|| format!("bad JSON in {}", self.file.display()))?;
        let now = now_ms();
        let mut events = Vec::new();
        for (n, event) in raw.iter().enumerate() {
            match expand_event(&self.name, event, n) {
                Ok(expanded) => {
                    // Finished events are of no further interest.
                    events.extend(expanded.into_iter().filter(|e| e.end > now));
                }
                Err(err) => warn!("calendar {}: skipping event {n}: {err:#}", self.name),
            }
        }
        Ok(events)
    }

    fn arm(self: &Arc<Self>, event: ScheduledEvent, generation: u64) {
        let calendar = self.clone();
        tokio::spawn(async move {
            let now = now_ms();
            if event.start > now {
                tokio::time::sleep(Duration::from_millis((event.start - now) as u64)).await;
            }
            if calendar.generation.load(Ordering::SeqCst) != generation {
                return; // superseded by a reload
            }
            debug!("calendar {}: event {} begins", calendar.name, event.id);
            if let Err(err) = calendar
                .services
                .make_request(&event.service, event.request.clone())
                .await
            {
                warn!("calendar {}: event {} rejected: {err}", calendar.name, event.id);
                return;
            }

            let remaining = event.end - now_ms();
            if remaining > 0 {
                tokio::time::sleep(Duration::from_millis(remaining as u64)).await;
            }
            if calendar.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            debug!("calendar {}: event {} ends", calendar.name, event.id);
            calendar
                .services
                .purge_requests(&event.service, &RequestMatch::by_source(event.request.source.as_str()), true)
                .await;
        });
    }
}

/// Reload immediately, then on the configured interval until `stop`
/// flips.
pub fn spawn_calendar_loop(
    calendar: Arc<Calendar>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(calendar.update_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if stop.load(Ordering::SeqCst) {
                debug!("calendar {} stopped", calendar.name);
                return;
            }
            calendar.reload().await;
        }
    })
}

fn epoch_ms(raw: &UntilWire) -> anyhow::Result<i64> {
    match Until::parse(raw)? {
        Until::At(ms) => Ok(ms),
        other => Err(anyhow::anyhow!("expected a time, got {other:?}")),
    }
}

fn expand_event(
    calendar_name: &str,
    event: &RawEvent,
    ordinal: usize,
) -> anyhow::Result<Vec<ScheduledEvent>> {
    let start = epoch_ms(&event.start)?;
    let end = epoch_ms(&event.end)?;
    let id = event
        .id
        .clone()
        .unwrap_or_else(|| format!("{calendar_name}#{ordinal}"));

    let directives = if let Some(text) = &event.text {
        parse_event_text(text)?
    } else {
        let service = event
            .service
            .clone()
            .ok_or_else(|| anyhow::anyhow!("event has neither text nor service"))?;
        let temperature = event
            .temperature
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("event has no temperature"))?;
        vec![Directive {
            service,
            boost: false,
            temperature: TargetTemp::parse(temperature)?,
        }]
    };

    directives
        .into_iter()
        .map(|d| {
            let until = if d.boost { Until::Boost } else { Until::At(end) };
            Ok(ScheduledEvent {
                id: id.clone(),
                service: d.service,
                start,
                end,
                request: Request::new(calendar_name, until, d.temperature)?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
struct Directive {
    service: String,
    boost: bool,
    temperature: TargetTemp,
}

/// Parse free event text. Each `;`-separated segment is
/// `service ["="] ["boost"] (temperature | "off")`, case-insensitive,
/// e.g. `"CH BOOST 18"`, `"hw=50; ch=20"`, `"all off"`.
fn parse_event_text(text: &str) -> anyhow::Result<Vec<Directive>> {
    let mut directives = Vec::new();
    for segment in text.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let mut tokens = segment
            .split(|c: char| c.is_whitespace() || c == '=')
            .filter(|t| !t.is_empty());
        let service = tokens
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty directive in {text:?}"))?
            .to_uppercase();
        let mut token = tokens
            .next()
            .ok_or_else(|| anyhow::anyhow!("no temperature in {segment:?}"))?;
        let boost = token.eq_ignore_ascii_case("boost");
        if boost {
            token = tokens
                .next()
                .ok_or_else(|| anyhow::anyhow!("no temperature in {segment:?}"))?;
        }
        if tokens.next().is_some() {
            return Err(anyhow::anyhow!("trailing tokens in {segment:?}"));
        }
        let temperature = if token.eq_ignore_ascii_case("off") {
            TargetTemp::Off
        } else {
            TargetTemp::Degrees(
                token
                    .parse()
                    .map_err(|_| anyhow::anyhow!("bad temperature {token:?}"))?,
            )
        };
        directives.push(Directive {
            service,
            boost,
            temperature,
        });
    }
    Ok(directives)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;

    use heating_common::{CalendarConfig, Channel, TimeValue, Timeline, DAY_MS};

    use crate::hardware::{SimSensor, TempSensor};
    use crate::thermostat::ThermostatService;

    use super::*;

    fn ch_services() -> Arc<ServiceMap> {
        let timeline =
            Timeline::new(0.0, 25.0, DAY_MS, vec![TimeValue::new(0, 20.0)]).unwrap();
        let thermostat = ThermostatService::new(
            Channel::Ch,
            TempSensor::Sim(SimSensor::new(20.0)),
            Duration::from_secs(20),
            timeline,
            None,
        );
        let mut map = BTreeMap::new();
        map.insert(Channel::Ch, Arc::new(thermostat));
        Arc::new(ServiceMap::new(map))
    }

    fn scratch_file() -> std::path::PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let file = std::env::temp_dir().join(format!(
            "heating-calendar-{}-{n}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&file);
        file
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_live_event_withdraws_its_request() {
        let services = ch_services();
        let file = scratch_file();
        let now = now_ms();
        std::fs::write(
            &file,
            format!(
                r#"[{{"start": {}, "end": {}, "text": "CH BOOST 21"}}]"#,
                now - 1_000,
                now + 3_600_000
            ),
        )
        .unwrap();

        let calendar = Arc::new(Calendar::new(
            CalendarConfig {
                name: "home".to_string(),
                file: file.clone(),
                update_interval_s: 60,
            },
            services.clone(),
        ));
        calendar.reload().await;
        // Let the armed begin timer deliver the request.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let ch = services.get(Channel::Ch).unwrap().clone();
        assert_eq!(ch.status().await.requests.len(), 1);

        std::fs::write(&file, "[]").unwrap();
        calendar.reload().await;
        assert!(ch.status().await.requests.is_empty());
        let _ = std::fs::remove_file(&file);
    }

    fn directive(service: &str, boost: bool, temperature: TargetTemp) -> Directive {
        Directive {
            service: service.to_string(),
            boost,
            temperature,
        }
    }

    #[test]
    fn parses_boost_directive() {
        assert_eq!(
            parse_event_text("CH BOOST 18").unwrap(),
            vec![directive("CH", true, TargetTemp::Degrees(18.0))]
        );
    }

    #[test]
    fn parses_multiple_directives() {
        assert_eq!(
            parse_event_text("hw=50; ch=20").unwrap(),
            vec![
                directive("HW", false, TargetTemp::Degrees(50.0)),
                directive("CH", false, TargetTemp::Degrees(20.0)),
            ]
        );
    }

    #[test]
    fn parses_all_off() {
        assert_eq!(
            parse_event_text("all off").unwrap(),
            vec![directive("ALL", false, TargetTemp::Off)]
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_event_text("CH").is_err());
        assert!(parse_event_text("CH warm").is_err());
        assert!(parse_event_text("CH 18 junk").is_err());
    }

    #[test]
    fn expands_text_events() {
        let event = RawEvent {
            id: Some("e1".to_string()),
            start: UntilWire::Epoch(1_000),
            end: UntilWire::Epoch(2_000),
            text: Some("hw boost 55; ch 19".to_string()),
            service: None,
            temperature: None,
        };
        let events = expand_event("home", &event, 0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].service, "HW");
        assert_eq!(events[0].request.until, Until::Boost);
        assert_eq!(events[1].service, "CH");
        assert_eq!(events[1].request.until, Until::At(2_000));
        assert_eq!(events[1].request.source, "home");
    }

    #[test]
    fn expands_explicit_events() {
        let event = RawEvent {
            id: None,
            start: UntilWire::Text("2026-03-01T06:00:00Z".to_string()),
            end: UntilWire::Text("2026-03-01T08:00:00Z".to_string()),
            text: None,
            service: Some("CH".to_string()),
            temperature: Some(TemperatureWire::Degrees(21.0)),
        };
        let events = expand_event("home", &event, 3).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "home#3");
        assert!(events[0].start < events[0].end);
    }
}

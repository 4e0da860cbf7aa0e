//! Append-only history logger. Each log is a file of `time,value`
//! lines. A historian either records on demand (pin state changes) or
//! samples a callback on a fixed interval, skipping repeats.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use heating_common::trace::{encode_trace, format_log, parse_log, sort_unordered, Sample};
use heating_common::HistoryConfig;

use crate::clock::now_ms;

#[derive(Debug, Default)]
struct LastRecord {
    time: Option<i64>,
    value: Option<f64>,
}

#[derive(Debug)]
pub struct Historian {
    name: String,
    config: HistoryConfig,
    last: Mutex<LastRecord>,
}

impl Historian {
    pub fn new(name: impl Into<String>, config: HistoryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            last: Mutex::new(LastRecord::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    /// Append a sample. When more than 1.25 sample intervals have
    /// passed since the last record, a checkpoint carrying the previous
    /// value is written first so a plot of the log doesn't interpolate
    /// across the gap.
    pub async fn record(&self, value: f64, time: Option<i64>) -> anyhow::Result<()> {
        let time = time.unwrap_or_else(now_ms);
        let mut last = self.last.lock().await;

        let mut lines = String::new();
        if let (Some(last_time), Some(last_value)) = (last.time, last.value) {
            let interval = self.config.interval_ms as i64;
            if time > last_time + 5 * interval / 4 {
                lines.push_str(&format!("{},{}\n", time - interval, last_value));
            }
        }
        lines.push_str(&format!("{time},{value}\n"));
        last.time = Some(time);
        last.value = Some(value);
        drop(last);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.file)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        Ok(())
    }

    /// Record only if the value changed since the last record. Used by
    /// the sampling loop.
    pub async fn record_if_changed(&self, value: f64) -> anyhow::Result<()> {
        {
            let last = self.last.lock().await;
            if last.value == Some(value) {
                return Ok(());
            }
        }
        self.record(value, None).await
    }

    /// Load the log. Unreadable files yield an empty history; for
    /// `unordered` logs the samples are sorted and, when duplicates
    /// were dropped, the file is rewritten.
    pub async fn load(&self) -> Vec<Sample> {
        let text = match tokio::fs::read_to_string(&self.config.file).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!("failed to open history {}: {err}", self.name);
                return Vec::new();
            }
        };
        let mut samples = parse_log(&text);
        if self.config.unordered && sort_unordered(&mut samples) {
            debug!("rewriting deduplicated history {}", self.name);
            if let Err(err) = tokio::fs::write(&self.config.file, format_log(&samples)).await {
                warn!("failed to rewrite history {}: {err}", self.name);
            }
        }
        samples
    }

    pub async fn encode_trace(&self, since: Option<i64>) -> Vec<f64> {
        encode_trace(&self.load().await, since, now_ms())
    }
}

/// Sampled mode: poll the sampler on the configured interval, writing a
/// record whenever the value changes. Runs until `stop` flips.
pub fn spawn_sampler<F>(
    historian: Arc<Historian>,
    sample: F,
    stop: Arc<std::sync::atomic::AtomicBool>,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> f64 + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(historian.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if stop.load(std::sync::atomic::Ordering::SeqCst) {
                debug!("historian {} stopped", historian.name());
                return;
            }
            if let Err(err) = historian.record_if_changed(sample()).await {
                warn!("historian {} record failed: {err}", historian.name());
            }
        }
    })
}

//! Encoding of history logs. A log file holds one `time,value` line per
//! sample (epoch ms, float). On the wire a trace is a flat numeric
//! array: the first element is a base time, followed by alternating
//! delta-time / value pairs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(time: i64, value: f64) -> Self {
        Self { time, value }
    }
}

/// Malformed lines are skipped.
pub fn parse_log(text: &str) -> Vec<Sample> {
    text.lines()
        .filter_map(|line| {
            let (time, value) = line.split_once(',')?;
            Some(Sample::new(
                time.trim().parse().ok()?,
                value.trim().parse().ok()?,
            ))
        })
        .collect()
}

pub fn format_log(samples: &[Sample]) -> String {
    let mut out = String::new();
    for s in samples {
        out.push_str(&format!("{},{}\n", s.time, s.value));
    }
    out
}

/// Of two samples at the same time the most recently added survives.
/// Returns true if any were dropped, so the caller rewrites the file.
pub fn sort_unordered(samples: &mut Vec<Sample>) -> bool {
    let before = samples.len();
    let mut indexed: Vec<(usize, Sample)> = samples.drain(..).enumerate().collect();
    indexed.sort_by(|(ai, a), (bi, b)| a.time.cmp(&b.time).then(ai.cmp(bi)));
    let mut deduped: Vec<Sample> = Vec::with_capacity(indexed.len());
    for (_, s) in indexed {
        match deduped.last_mut() {
            Some(prev) if prev.time == s.time => *prev = s,
            _ => deduped.push(s),
        }
    }
    *samples = deduped;
    samples.len() != before
}

/// `[basetime, dt, value, dt, value, ...]`, keeping samples at or
/// after `since`.
pub fn encode_trace(samples: &[Sample], since: Option<i64>, now_ms: i64) -> Vec<f64> {
    let base = samples.first().map(|s| s.time).unwrap_or(now_ms);
    let mut out = vec![base as f64];
    for s in samples {
        if since.map_or(true, |since| s.time >= since) {
            out.push((s.time - base) as f64);
            out.push(s.value);
        }
    }
    out
}

pub fn decode_trace(data: &[f64]) -> Vec<Sample> {
    let Some(&base) = data.first() else {
        return Vec::new();
    };
    data[1..]
        .chunks_exact(2)
        .map(|pair| Sample::new(base as i64 + pair[0] as i64, pair[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_and_formats_log_lines() {
        let samples = parse_log("1,0\n1001,10\nbad line\n1101,28\n");
        assert_eq!(
            samples,
            vec![
                Sample::new(1, 0.0),
                Sample::new(1001, 10.0),
                Sample::new(1101, 28.0),
            ]
        );
        assert_eq!(format_log(&samples), "1,0\n1001,10\n1101,28\n");
    }

    #[test]
    fn encodes_relative_to_base() {
        let samples = vec![
            Sample::new(1, 0.0),
            Sample::new(1001, 10.0),
            Sample::new(101, 28.0),
        ];
        let data = encode_trace(&samples, Some(0), 0);
        assert_eq!(data, vec![1.0, 0.0, 0.0, 1000.0, 10.0, 100.0, 28.0]);
        assert_eq!(decode_trace(&data), samples);
    }

    #[test]
    fn since_filters_but_keeps_base() {
        let samples = vec![Sample::new(100, 1.0), Sample::new(200, 2.0)];
        assert_eq!(encode_trace(&samples, Some(150), 0), vec![100.0, 100.0, 2.0]);
    }

    #[test]
    fn empty_trace_uses_now_as_base() {
        assert_eq!(encode_trace(&[], None, 42), vec![42.0]);
    }

    #[test]
    fn unordered_sort_keeps_latest_duplicate() {
        let mut samples = vec![
            Sample::new(200, 2.0),
            Sample::new(100, 1.0),
            Sample::new(200, 3.0),
        ];
        let rewrite = sort_unordered(&mut samples);
        assert!(rewrite);
        assert_eq!(samples, vec![Sample::new(100, 1.0), Sample::new(200, 3.0)]);

        let mut ordered = vec![Sample::new(1, 1.0), Sample::new(2, 2.0)];
        assert!(!sort_unordered(&mut ordered));
    }
}

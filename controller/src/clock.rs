use chrono::{Local, Timelike, Utc};

/// Wall-clock now, in epoch ms.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Offset of local now from the most recent local midnight, in ms.
/// This is the lookup key into a timeline.
pub fn day_offset_ms() -> u64 {
    let now = Local::now();
    let ms = now.num_seconds_from_midnight() as u64 * 1000 + now.timestamp_subsec_millis() as u64;
    // Leap seconds can nudge this past the period.
    ms.min(heating_common::DAY_MS - 1)
}

#[cfg(test)]
mod tests {
    use heating_common::DAY_MS;

    use super::*;

    #[test]
    fn day_offset_is_within_period() {
        assert!(day_offset_ms() < DAY_MS);
    }
}

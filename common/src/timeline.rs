use serde::{Deserialize, Serialize};

use crate::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeValue {
    pub time: u64,
    pub value: f64,
}

impl TimeValue {
    pub fn new(time: u64, value: f64) -> Self {
        Self { time, value }
    }
}

/// A continuous piecewise-linear graph giving a value at each point
/// over a fixed period (normally 24h). Times are ms offsets in
/// `0..period`, values are clamped into `min..=max`. There is always a
/// point at time 0; the curve wraps so that the region after the last
/// point interpolates towards `(period, points[0].value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub min: f64,
    pub max: f64,
    pub period: u64,
    points: Vec<TimeValue>,
}

pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;

impl Timeline {
    pub fn new(
        min: f64,
        max: f64,
        period: u64,
        points: Vec<TimeValue>,
    ) -> Result<Self, DomainError> {
        if max < min {
            return Err(DomainError::BadBounds { min, max });
        }
        if period == 0 {
            return Err(DomainError::BadPeriod);
        }
        let mut timeline = Self {
            min,
            max,
            period,
            points: Vec::new(),
        };
        // There is always a point at 00:00.
        timeline.points.push(TimeValue::new(0, min));
        for point in points {
            timeline.insert(point);
        }
        Ok(timeline)
    }

    /// Restore invariants after deserializing user-supplied JSON.
    pub fn validated(self) -> Result<Self, DomainError> {
        Self::new(self.min, self.max, self.period, self.points)
    }

    pub fn points(&self) -> &[TimeValue] {
        &self.points
    }

    fn check_range(&self, t: u64) -> Result<(), DomainError> {
        if t >= self.period {
            return Err(DomainError::OutOfRange {
                time: t,
                period: self.period,
            });
        }
        Ok(())
    }

    pub fn point_before(&self, t: u64) -> Result<TimeValue, DomainError> {
        self.check_range(t)?;
        let mut prev = self.points[0];
        for point in &self.points {
            if point.time > t {
                break;
            }
            prev = *point;
        }
        Ok(prev)
    }

    /// `None` past the last point; interpolate against the wrap point.
    pub fn point_after(&self, t: u64) -> Result<Option<TimeValue>, DomainError> {
        self.check_range(t)?;
        Ok(self.points.iter().copied().find(|point| point.time >= t))
    }

    pub fn value_at(&self, t: u64) -> Result<f64, DomainError> {
        let p0 = self.point_before(t)?;
        let p1 = self
            .point_after(t)?
            .unwrap_or_else(|| TimeValue::new(self.period, self.points[0].value));
        if p1.time == p0.time {
            return Ok(p0.value);
        }
        Ok(p0.value
            + (t - p0.time) as f64 * (p1.value - p0.value) / (p1.time - p0.time) as f64)
    }

    /// Inserting at an existing time replaces. Returns the landing
    /// index.
    pub fn insert(&mut self, mut point: TimeValue) -> usize {
        point.value = point.value.clamp(self.min, self.max);
        match self.points.iter().position(|p| p.time >= point.time) {
            Some(i) if self.points[i].time == point.time => {
                self.points[i] = point;
                i
            }
            Some(i) => {
                self.points.insert(i, point);
                i
            }
            None => {
                self.points.push(point);
                self.points.len() - 1
            }
        }
    }

    pub fn remove(&mut self, index: usize) -> Result<TimeValue, DomainError> {
        if index == 0 {
            return Err(DomainError::ProtectedPoint);
        }
        if index >= self.points.len() {
            return Err(DomainError::NoSuchPoint(index));
        }
        Ok(self.points.remove(index))
    }

    /// Returns the point's new index.
    pub fn set_time(&mut self, index: usize, t: u64) -> Result<usize, DomainError> {
        if index == 0 {
            return Err(DomainError::ProtectedPoint);
        }
        let mut point = self.remove(index)?;
        point.time = t.min(self.period);
        Ok(self.insert(point))
    }

    /// Returns the clamped value so callers can report clipping.
    pub fn set_value(&mut self, index: usize, v: f64) -> Result<f64, DomainError> {
        if index >= self.points.len() {
            return Err(DomainError::NoSuchPoint(index));
        }
        let clamped = v.clamp(self.min, self.max);
        self.points[index].value = clamped;
        Ok(clamped)
    }

    pub fn highest_value(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.value)
            .fold(f64::MIN, f64::max)
    }

    pub fn lowest_value(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.value)
            .fold(f64::MAX, f64::min)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn two_knot() -> Timeline {
        // 10C at midnight rising to 40C at 18:00.
        Timeline::new(
            0.0,
            50.0,
            DAY_MS,
            vec![
                TimeValue::new(0, 10.0),
                TimeValue::new(18 * 60 * 60 * 1000, 40.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn synthesizes_zero_point() {
        let timeline = Timeline::new(5.0, 25.0, DAY_MS, vec![TimeValue::new(1000, 20.0)]).unwrap();
        assert_eq!(timeline.points()[0], TimeValue::new(0, 5.0));
        assert_eq!(timeline.points().len(), 2);
    }

    #[test]
    fn rejects_bad_bounds() {
        assert_eq!(
            Timeline::new(10.0, 5.0, DAY_MS, vec![]),
            Err(DomainError::BadBounds { min: 10.0, max: 5.0 })
        );
        assert_eq!(Timeline::new(0.0, 1.0, 0, vec![]), Err(DomainError::BadPeriod));
    }

    #[test]
    fn interpolates_between_knots() {
        let timeline = two_knot();
        // 09:00 is halfway to 18:00.
        assert_eq!(timeline.value_at(9 * 60 * 60 * 1000).unwrap(), 25.0);
    }

    #[test]
    fn exact_at_knots() {
        let timeline = two_knot();
        assert_eq!(timeline.value_at(0).unwrap(), 10.0);
        assert_eq!(timeline.value_at(18 * 60 * 60 * 1000).unwrap(), 40.0);
    }

    #[test]
    fn wraps_after_last_knot() {
        let timeline = two_knot();
        // 21:00 is halfway from the 18:00 knot back to the midnight value.
        let t = 21 * 60 * 60 * 1000;
        assert_eq!(timeline.value_at(t).unwrap(), 25.0);
    }

    #[test]
    fn rejects_out_of_range_lookup() {
        let timeline = two_knot();
        assert_eq!(
            timeline.value_at(DAY_MS),
            Err(DomainError::OutOfRange {
                time: DAY_MS,
                period: DAY_MS
            })
        );
        assert!(timeline.point_before(DAY_MS + 1).is_err());
        assert!(timeline.point_after(DAY_MS).is_err());
    }

    #[test]
    fn point_after_is_none_past_last_knot() {
        let timeline = two_knot();
        assert_eq!(timeline.point_after(20 * 60 * 60 * 1000).unwrap(), None);
    }

    #[test]
    fn insert_replaces_at_same_time() {
        let mut timeline = two_knot();
        timeline.insert(TimeValue::new(18 * 60 * 60 * 1000, 30.0));
        assert_eq!(timeline.points().len(), 2);
        assert_eq!(timeline.value_at(18 * 60 * 60 * 1000).unwrap(), 30.0);
    }

    #[test]
    fn insert_clamps_value() {
        let mut timeline = two_knot();
        let i = timeline.insert(TimeValue::new(1000, 999.0));
        assert_eq!(timeline.points()[i].value, 50.0);
    }

    #[test]
    fn zero_point_cannot_be_removed_or_moved() {
        let mut timeline = two_knot();
        assert_eq!(timeline.remove(0), Err(DomainError::ProtectedPoint));
        assert_eq!(timeline.set_time(0, 5), Err(DomainError::ProtectedPoint));
    }

    #[test]
    fn set_time_keeps_points_sorted() {
        let mut timeline = two_knot();
        timeline.insert(TimeValue::new(6 * 60 * 60 * 1000, 20.0));
        // Move the 06:00 point past 18:00.
        let i = timeline
            .points()
            .iter()
            .position(|p| p.time == 6 * 60 * 60 * 1000)
            .unwrap();
        let moved = timeline.set_time(i, 20 * 60 * 60 * 1000).unwrap();
        assert_eq!(moved, 2);
        let times: Vec<u64> = timeline.points().iter().map(|p| p.time).collect();
        let mut sorted = times.clone();
        sorted.sort_unstable();
        assert_eq!(times, sorted);
        assert_eq!(timeline.points()[0].time, 0);
    }

    #[test]
    fn set_value_reports_clamp() {
        let mut timeline = two_knot();
        assert_eq!(timeline.set_value(1, 80.0).unwrap(), 50.0);
        assert_eq!(timeline.set_value(1, -10.0).unwrap(), 0.0);
    }

    #[test]
    fn extremes_scan_all_points() {
        let timeline = two_knot();
        assert_eq!(timeline.highest_value(), 40.0);
        assert_eq!(timeline.lowest_value(), 10.0);
    }

    #[test]
    fn survives_serde_round_trip() {
        let timeline = two_knot();
        let json = serde_json::to_string(&timeline).unwrap();
        let back: Timeline = serde_json::from_str(&json).unwrap();
        assert_eq!(back.validated().unwrap(), timeline);
    }
}

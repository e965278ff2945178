//! Cycle points and cycling sequences
//!
//! A workflow cycles over a calendar of points: plain integers or UTC
//! datetimes. A single workflow uses one kind throughout; the two never mix
//! within a graph.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CyclingError;

/// Compact ISO-8601 form used for datetime points, e.g. `20240101T0600Z`.
const POINT_FORMAT: &str = "%Y%m%dT%H%MZ";

/// A point in the workflow's cycling calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CyclePoint {
    Integer(i64),
    DateTime(DateTime<Utc>),
}

impl CyclePoint {
    /// Advance this point by an interval.
    ///
    /// Mixing an integer point with a time interval (or vice versa) is a
    /// cycling error; a well-formed config never does this.
    pub fn add(&self, interval: &Interval) -> Result<CyclePoint, CyclingError> {
        match (self, interval) {
            (CyclePoint::Integer(n), Interval::Points(step)) => Ok(CyclePoint::Integer(n + step)),
            (CyclePoint::DateTime(t), Interval::Seconds(secs)) => {
                Ok(CyclePoint::DateTime(*t + Duration::seconds(*secs)))
            }
            _ => Err(CyclingError::IntervalKind {
                point: self.to_string(),
                interval: interval.to_string(),
            }),
        }
    }

    /// Wall-clock time of this point, for clock-based triggers and expiry.
    /// Integer points have no wall-clock equivalent.
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            CyclePoint::Integer(_) => None,
            CyclePoint::DateTime(t) => Some(*t),
        }
    }
}

impl fmt::Display for CyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePoint::Integer(n) => write!(f, "{}", n),
            CyclePoint::DateTime(t) => write!(f, "{}", t.format(POINT_FORMAT)),
        }
    }
}

impl FromStr for CyclePoint {
    type Err = CyclingError;

    /// Parse an integer point first, then ISO-8601 datetime forms.
    /// The legacy `YYYY/MM/DD-HH:mm` form is not accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<i64>() {
            return Ok(CyclePoint::Integer(n));
        }
        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
            return Ok(CyclePoint::DateTime(t.with_timezone(&Utc)));
        }
        for format in [POINT_FORMAT, "%Y%m%dT%H%M%SZ", "%Y-%m-%dT%H:%MZ"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                return Ok(CyclePoint::DateTime(Utc.from_utc_datetime(&naive)));
            }
        }
        Err(CyclingError::BadPoint(s.to_string()))
    }
}

impl Serialize for CyclePoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CyclePoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(CyclePoint::Integer(n)),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// The step between consecutive points of a sequence.
///
/// Serialized as a bare integer (points) or an ISO-8601 duration string
/// (seconds), e.g. `PT6H`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    /// Integer cycling: step in points.
    Points(i64),
    /// Datetime cycling: step in seconds.
    Seconds(i64),
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Points(n) => write!(f, "P{}", n),
            Interval::Seconds(s) => write!(f, "PT{}S", s),
        }
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Interval::Points(n) => serializer.serialize_i64(*n),
            Interval::Seconds(s) => serializer.serialize_str(&format!("PT{}S", s)),
        }
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Points(i64),
            Duration(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Points(n) => Ok(Interval::Points(n)),
            Raw::Duration(s) => parse_iso_duration(&s)
                .map(Interval::Seconds)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Parse a restricted ISO-8601 duration (`P1D`, `PT6H`, `PT30M`, `PT10S`,
/// and combinations) into seconds.
pub fn parse_iso_duration(s: &str) -> Result<i64, CyclingError> {
    let err = || CyclingError::BadDuration(s.to_string());
    let body = s.strip_prefix('P').ok_or_else(err)?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, t),
        None => (body, ""),
    };
    let mut secs: i64 = 0;
    let mut num = String::new();
    for ch in date_part.chars() {
        if ch.is_ascii_digit() {
            num.push(ch);
        } else {
            let n: i64 = num.parse().map_err(|_| err())?;
            num.clear();
            secs += match ch {
                'W' => n * 7 * 86_400,
                'D' => n * 86_400,
                _ => return Err(err()),
            };
        }
    }
    if !num.is_empty() {
        return Err(err());
    }
    for ch in time_part.chars() {
        if ch.is_ascii_digit() {
            num.push(ch);
        } else {
            let n: i64 = num.parse().map_err(|_| err())?;
            num.clear();
            secs += match ch {
                'H' => n * 3_600,
                'M' => n * 60,
                'S' => n,
                _ => return Err(err()),
            };
        }
    }
    if !num.is_empty() || (date_part.is_empty() && time_part.is_empty()) {
        return Err(err());
    }
    Ok(secs)
}

/// A cycling recurrence: the points at which a task runs.
///
/// `interval: None` is a run-once sequence (the task runs at `start` only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub start: CyclePoint,
    #[serde(default)]
    pub stop: Option<CyclePoint>,
    #[serde(default)]
    pub interval: Option<Interval>,
}

impl Sequence {
    /// Run-once sequence at a single point.
    pub fn once(point: CyclePoint) -> Self {
        Self {
            start: point,
            stop: Some(point),
            interval: None,
        }
    }

    fn in_bounds(&self, point: &CyclePoint) -> bool {
        *point >= self.start && self.stop.map_or(true, |stop| *point <= stop)
    }

    /// First on-sequence point at or after `from`.
    pub fn first_point(&self, from: &CyclePoint) -> Option<CyclePoint> {
        let mut point = self.start;
        loop {
            if !self.in_bounds(&point) {
                return None;
            }
            if point >= *from {
                return Some(point);
            }
            point = self.next_point(&point)?;
        }
    }

    /// On-sequence point immediately after `point`, if any.
    pub fn next_point(&self, point: &CyclePoint) -> Option<CyclePoint> {
        let interval = self.interval.as_ref()?;
        let next = point.add(interval).ok()?;
        self.in_bounds(&next).then_some(next)
    }

    /// Whether `point` lies on this sequence.
    pub fn is_on_sequence(&self, point: &CyclePoint) -> bool {
        let mut p = self.start;
        loop {
            if p == *point {
                return true;
            }
            if p > *point {
                return false;
            }
            match self.next_point(&p) {
                Some(next) => p = next,
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_point_parse_and_order() {
        let a: CyclePoint = "1".parse().unwrap();
        let b: CyclePoint = "10".parse().unwrap();
        assert_eq!(a, CyclePoint::Integer(1));
        assert!(a < b);
    }

    #[test]
    fn test_datetime_point_parse() {
        let p: CyclePoint = "20240101T0600Z".parse().unwrap();
        assert_eq!(p.to_string(), "20240101T0600Z");
        let rfc: CyclePoint = "2024-01-01T06:00:00Z".parse().unwrap();
        assert_eq!(p, rfc);
    }

    #[test]
    fn test_legacy_clock_format_rejected() {
        assert!("2024/01/01-06:00".parse::<CyclePoint>().is_err());
    }

    #[test]
    fn test_iso_duration_parse() {
        assert_eq!(parse_iso_duration("PT6H").unwrap(), 6 * 3600);
        assert_eq!(parse_iso_duration("P1D").unwrap(), 86_400);
        assert_eq!(parse_iso_duration("P1DT30M").unwrap(), 86_400 + 1800);
        assert!(parse_iso_duration("6H").is_err());
        assert!(parse_iso_duration("P").is_err());
    }

    #[test]
    fn test_sequence_iteration() {
        let seq = Sequence {
            start: CyclePoint::Integer(1),
            stop: Some(CyclePoint::Integer(5)),
            interval: Some(Interval::Points(2)),
        };
        assert_eq!(seq.first_point(&CyclePoint::Integer(1)), Some(CyclePoint::Integer(1)));
        assert_eq!(seq.first_point(&CyclePoint::Integer(2)), Some(CyclePoint::Integer(3)));
        assert_eq!(seq.next_point(&CyclePoint::Integer(5)), None);
        assert!(seq.is_on_sequence(&CyclePoint::Integer(3)));
        assert!(!seq.is_on_sequence(&CyclePoint::Integer(4)));
    }

    #[test]
    fn test_run_once_sequence() {
        let seq = Sequence::once(CyclePoint::Integer(1));
        assert_eq!(seq.first_point(&CyclePoint::Integer(1)), Some(CyclePoint::Integer(1)));
        assert_eq!(seq.next_point(&CyclePoint::Integer(1)), None);
    }

    #[test]
    fn test_mixed_interval_kind_rejected() {
        let p = CyclePoint::Integer(1);
        assert!(p.add(&Interval::Seconds(60)).is_err());
    }

    #[test]
    fn test_interval_serde_forms() {
        let points: Interval = serde_yaml::from_str("2").unwrap();
        assert_eq!(points, Interval::Points(2));
        let secs: Interval = serde_yaml::from_str("PT6H").unwrap();
        assert_eq!(secs, Interval::Seconds(6 * 3600));
        assert!(serde_yaml::from_str::<Interval>("\"6 hours\"").is_err());
    }
}

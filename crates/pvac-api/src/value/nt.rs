// ── Normative-type helpers ──
//
// The scalar record shape (`value`, `alarm`, `timeStamp`) and the joined
// multi-channel container, plus typed views of alarm and time stamp.

use chrono::{DateTime, Utc};

use super::{PvField, PvStructure, Scalar, ScalarArray};

pub const NT_SCALAR_ID: &str = "epics:nt/NTScalar:1.0";
pub const NT_SCALAR_ARRAY_ID: &str = "epics:nt/NTScalarArray:1.0";
pub const NT_MULTI_CHANNEL_ID: &str = "epics:nt/NTMultiChannel:1.0";
pub const ALARM_ID: &str = "alarm_t";
pub const TIME_STAMP_ID: &str = "time_t";

// ── Alarm ────────────────────────────────────────────────────────

/// Typed view of an `alarm_t` structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alarm {
    pub severity: i32,
    pub status: i32,
    pub message: String,
}

impl Alarm {
    /// Read from an `alarm_t`-shaped structure; missing fields default.
    pub fn from_structure(s: &PvStructure) -> Self {
        let int = |name: &str| {
            s.scalar(name)
                .and_then(|v| v.convert(super::ScalarType::Int).ok())
                .and_then(|v| match v {
                    Scalar::Int(i) => Some(i),
                    _ => None,
                })
                .unwrap_or_default()
        };
        Self {
            severity: int("severity"),
            status: int("status"),
            message: s
                .scalar("message")
                .map(ToString::to_string)
                .unwrap_or_default(),
        }
    }

    pub fn to_structure(&self) -> PvStructure {
        PvStructure::new(ALARM_ID)
            .with_field("severity", Scalar::Int(self.severity))
            .with_field("status", Scalar::Int(self.status))
            .with_field("message", Scalar::String(self.message.clone()))
    }
}

// ── TimeStamp ────────────────────────────────────────────────────

/// Typed view of a `time_t` structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeStamp {
    pub seconds_past_epoch: i64,
    pub nanoseconds: i32,
    pub user_tag: i32,
}

impl TimeStamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            seconds_past_epoch: at.timestamp(),
            nanoseconds: i32::try_from(at.timestamp_subsec_nanos()).unwrap_or_default(),
            user_tag: 0,
        }
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(
            self.seconds_past_epoch,
            u32::try_from(self.nanoseconds).unwrap_or_default(),
        )
    }

    pub fn from_structure(s: &PvStructure) -> Self {
        let long = |name: &str| match s.scalar(name).map(|v| v.convert(super::ScalarType::Long)) {
            Some(Ok(Scalar::Long(v))) => v,
            _ => 0,
        };
        Self {
            seconds_past_epoch: long("secondsPastEpoch"),
            nanoseconds: i32::try_from(long("nanoseconds")).unwrap_or_default(),
            user_tag: i32::try_from(long("userTag")).unwrap_or_default(),
        }
    }

    pub fn to_structure(&self) -> PvStructure {
        PvStructure::new(TIME_STAMP_ID)
            .with_field("secondsPastEpoch", Scalar::Long(self.seconds_past_epoch))
            .with_field("nanoseconds", Scalar::Int(self.nanoseconds))
            .with_field("userTag", Scalar::Int(self.user_tag))
    }

    /// Seconds elapsed from `base` to `self` (negative if earlier).
    #[allow(clippy::cast_precision_loss)]
    pub fn seconds_since(&self, base: &Self) -> f64 {
        let secs = (self.seconds_past_epoch - base.seconds_past_epoch) as f64;
        let nanos = f64::from(self.nanoseconds - base.nanoseconds);
        secs + nanos * 1e-9
    }
}

// ── Record shapes ────────────────────────────────────────────────

/// A scalar record: `value`, `alarm`, `timeStamp`.
pub fn nt_scalar(value: Scalar) -> PvStructure {
    PvStructure::new(NT_SCALAR_ID)
        .with_field("value", value)
        .with_field("alarm", Alarm::default().to_structure())
        .with_field("timeStamp", TimeStamp::now().to_structure())
}

/// A scalar-array record: `value`, `alarm`, `timeStamp`.
pub fn nt_scalar_array(value: ScalarArray) -> PvStructure {
    PvStructure::new(NT_SCALAR_ARRAY_ID)
        .with_field("value", value)
        .with_field("alarm", Alarm::default().to_structure())
        .with_field("timeStamp", TimeStamp::now().to_structure())
}

/// An empty variant-union array of `len` slots.
pub fn union_array(len: usize) -> PvField {
    PvField::UnionArray(vec![None; len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_round_trips_through_structure() {
        let alarm = Alarm {
            severity: 2,
            status: 3,
            message: "HIHI".into(),
        };
        assert_eq!(Alarm::from_structure(&alarm.to_structure()), alarm);
    }

    #[test]
    fn seconds_since_handles_nanos() {
        let base = TimeStamp {
            seconds_past_epoch: 100,
            nanoseconds: 900_000_000,
            user_tag: 0,
        };
        let later = TimeStamp {
            seconds_past_epoch: 101,
            nanoseconds: 400_000_000,
            user_tag: 0,
        };
        assert!((later.seconds_since(&base) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn scalar_record_shape() {
        let rec = nt_scalar(Scalar::Double(1.0));
        assert_eq!(rec.id(), NT_SCALAR_ID);
        assert!(rec.field("alarm.severity").is_some());
        assert!(rec.field("timeStamp.userTag").is_some());
    }
}

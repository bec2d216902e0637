// ── Joined multi-channel structure ──
//
// Builds an NTMultiChannel container from per-channel values: a union
// array of the channels' `value` fields aligned by index, plus parallel
// arrays for names, connection, alarm and time stamp. Alarm and time
// stamp arrays appear only when at least one channel supplied them.

use pvac_api::value::nt::{Alarm, NT_MULTI_CHANNEL_ID, TimeStamp};
use pvac_api::{PvField, PvStructure, ScalarArray};

/// Severity reported for a channel that supplied no value.
pub(crate) const ABSENT_SEVERITY: i32 = 3;

/// One channel's contribution to the joined structure.
pub(crate) struct Slot<'a> {
    pub name: &'a str,
    pub connected: bool,
    pub value: Option<&'a PvStructure>,
}

pub(crate) fn join(slots: &[Slot<'_>]) -> PvStructure {
    let values = slots
        .iter()
        .map(|slot| slot.value.and_then(|v| v.field("value")).cloned())
        .collect();
    let mut out = PvStructure::new(NT_MULTI_CHANNEL_ID)
        .with_field("value", PvField::UnionArray(values))
        .with_field(
            "channelName",
            ScalarArray::from_strings(slots.iter().map(|s| s.name)),
        )
        .with_field(
            "isConnected",
            ScalarArray::from_bools(slots.iter().map(|s| s.connected)),
        );

    let alarms: Vec<Option<Alarm>> = slots
        .iter()
        .map(|slot| slot.value.and_then(|v| v.structure("alarm")).map(Alarm::from_structure))
        .collect();
    if alarms.iter().any(Option::is_some) {
        let absent = |slot: &Slot<'_>| Alarm {
            severity: ABSENT_SEVERITY,
            status: 0,
            message: if slot.connected { "no data" } else { "not connected" }.into(),
        };
        let alarms: Vec<Alarm> = alarms
            .into_iter()
            .zip(slots)
            .map(|(alarm, slot)| alarm.unwrap_or_else(|| absent(slot)))
            .collect();
        out.add_field("severity", ScalarArray::from_ints(alarms.iter().map(|a| a.severity)));
        out.add_field("status", ScalarArray::from_ints(alarms.iter().map(|a| a.status)));
        out.add_field(
            "message",
            ScalarArray::from_strings(alarms.iter().map(|a| a.message.clone())),
        );
    }

    let stamps: Vec<Option<TimeStamp>> = slots
        .iter()
        .map(|slot| {
            slot.value
                .and_then(|v| v.structure("timeStamp"))
                .map(TimeStamp::from_structure)
        })
        .collect();
    let base = stamps
        .iter()
        .flatten()
        .min_by_key(|t| (t.seconds_past_epoch, t.nanoseconds))
        .cloned();
    if let Some(base) = base {
        let present = || stamps.iter().map(|t| t.clone().unwrap_or_default());
        out.add_field(
            "secondsPastEpoch",
            ScalarArray::from_longs(present().map(|t| t.seconds_past_epoch)),
        );
        out.add_field("nanoseconds", ScalarArray::from_ints(present().map(|t| t.nanoseconds)));
        out.add_field("userTag", ScalarArray::from_ints(present().map(|t| t.user_tag)));
        out.add_field(
            "elapsed",
            ScalarArray::from_doubles(
                stamps
                    .iter()
                    .map(|t| t.as_ref().map_or(f64::NAN, |t| t.seconds_since(&base))),
            ),
        );
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pvac_api::value::nt::nt_scalar;
    use pvac_api::{Scalar, ScalarType};
    use pretty_assertions::assert_eq;

    use super::*;

    fn doubles(s: &PvStructure, path: &str) -> Vec<f64> {
        s.field(path)
            .and_then(PvField::as_scalar_array)
            .unwrap()
            .to_doubles()
            .unwrap()
    }

    #[test]
    fn absent_channel_leaves_empty_slot() {
        let a = nt_scalar(Scalar::Double(1.5));
        let joined = join(&[
            Slot {
                name: "a",
                connected: true,
                value: Some(&a),
            },
            Slot {
                name: "b",
                connected: false,
                value: None,
            },
        ]);
        assert_eq!(joined.id(), NT_MULTI_CHANNEL_ID);
        let Some(PvField::UnionArray(values)) = joined.field("value") else {
            panic!("value is not a union array");
        };
        assert_eq!(values[0], Some(PvField::Scalar(Scalar::Double(1.5))));
        assert_eq!(values[1], None);
        assert_eq!(doubles(&joined, "severity"), vec![0.0, 3.0]);
        let messages = joined.field("message").and_then(PvField::as_scalar_array).unwrap();
        assert_eq!(messages.to_strings(), vec!["".to_owned(), "not connected".to_owned()]);
        assert!(doubles(&joined, "elapsed")[1].is_nan());
    }

    #[test]
    fn bare_values_omit_alarm_and_time() {
        let bare = PvStructure::new("").with_field("value", Scalar::Int(4));
        let joined = join(&[Slot {
            name: "a",
            connected: true,
            value: Some(&bare),
        }]);
        assert!(joined.field("severity").is_none());
        assert!(joined.field("elapsed").is_none());
        let names = joined.field("channelName").and_then(PvField::as_scalar_array).unwrap();
        assert_eq!(names.element_type(), ScalarType::String);
    }
}

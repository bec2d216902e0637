// ── Structured value views ──
//
// Wrappers around one received structure plus its changed bitset. The
// read accessors live on the `ValueView` trait so get, put and monitor data
// share them; each flavor adds its own mutation or overrun tracking.

mod get;
mod monitor;
mod put;

use std::fmt::Write as _;

use pvac_api::value::nt::{Alarm, TimeStamp};
use pvac_api::{BitSet, PvField, PvStructure, Scalar, ScalarType};

pub use self::get::GetData;
pub use self::monitor::MonitorData;
pub use self::put::PutData;
use crate::error::CoreError;

/// Typed read access to a structure whose primary field is `value`.
pub trait ValueView {
    /// Channel the data came from; used to annotate errors.
    fn channel_name(&self) -> &str;

    /// The structure, if a shape or value has been received.
    fn structure(&self) -> Option<&PvStructure>;

    /// Fields changed by the most recent exchange.
    fn changed_bitset(&self) -> &BitSet;

    fn pv_structure(&self) -> Result<&PvStructure, CoreError> {
        self.structure().ok_or_else(|| CoreError::NoData {
            channel: self.channel_name().to_owned(),
            operation: "data".into(),
        })
    }

    fn has_value(&self) -> bool {
        self.structure().is_some_and(|s| s.field("value").is_some())
    }

    fn value(&self) -> Result<&PvField, CoreError> {
        self.pv_structure()?
            .field("value")
            .ok_or_else(|| CoreError::FieldNotFound {
                field: "value".into(),
            })
    }

    fn is_value_scalar(&self) -> bool {
        matches!(self.value(), Ok(PvField::Scalar(_)))
    }

    fn is_value_scalar_array(&self) -> bool {
        matches!(self.value(), Ok(PvField::ScalarArray(_)))
    }

    fn get_double(&self) -> Result<f64, CoreError> {
        let field = self.value()?;
        let converted = field.as_scalar().map(|s| s.convert(ScalarType::Double));
        match converted {
            Some(Ok(Scalar::Double(v))) => Ok(v),
            _ => Err(mismatch("value", "numeric scalar", field)),
        }
    }

    fn get_string(&self) -> Result<String, CoreError> {
        match self.value()? {
            PvField::Scalar(s) => Ok(s.to_string()),
            PvField::ScalarArray(a) => Ok(a.to_string()),
            other => Err(mismatch("value", "scalar or scalar array", other)),
        }
    }

    fn get_double_array(&self) -> Result<Vec<f64>, CoreError> {
        match self.value()? {
            PvField::ScalarArray(a) => Ok(a.to_doubles()?),
            other => Err(mismatch("value", "numeric array", other)),
        }
    }

    fn get_string_array(&self) -> Result<Vec<String>, CoreError> {
        match self.value()? {
            PvField::ScalarArray(a) => Ok(a.to_strings()),
            other => Err(mismatch("value", "scalar array", other)),
        }
    }

    fn alarm(&self) -> Result<Alarm, CoreError> {
        self.pv_structure()?
            .structure("alarm")
            .map(Alarm::from_structure)
            .ok_or_else(|| CoreError::FieldNotFound {
                field: "alarm".into(),
            })
    }

    fn time_stamp(&self) -> Result<TimeStamp, CoreError> {
        self.pv_structure()?
            .structure("timeStamp")
            .map(TimeStamp::from_structure)
            .ok_or_else(|| CoreError::FieldNotFound {
                field: "timeStamp".into(),
            })
    }

    /// Dotted paths of the changed fields; `""` for the whole structure.
    fn changed_fields(&self) -> Vec<String> {
        let Some(s) = self.structure() else {
            return Vec::new();
        };
        self.changed_bitset()
            .iter()
            .filter_map(|bit| s.path_of(bit))
            .collect()
    }

    /// One `path = value` line per changed field.
    fn show_changed(&self) -> String {
        render_bits(self.structure(), self.changed_bitset())
    }
}

pub(crate) fn mismatch(field: &str, expected: &str, found: &PvField) -> CoreError {
    CoreError::TypeMismatch {
        field: field.to_owned(),
        expected: expected.to_owned(),
        found: found.type_name(),
    }
}

pub(crate) fn render_bits(structure: Option<&PvStructure>, bits: &BitSet) -> String {
    let Some(s) = structure else {
        return String::new();
    };
    let mut out = String::new();
    for bit in bits.iter() {
        let Some(path) = s.path_of(bit) else {
            continue;
        };
        let rendered = if path.is_empty() {
            format!("{} (all fields)", s.type_id())
        } else {
            match s.field(&path) {
                Some(PvField::Scalar(v)) => v.to_string(),
                Some(PvField::ScalarArray(a)) => a.to_string(),
                Some(other) => other.type_name(),
                None => continue,
            }
        };
        let label = if path.is_empty() { "*" } else { path.as_str() };
        let _ = writeln!(out, "{label} = {rendered}");
    }
    out
}

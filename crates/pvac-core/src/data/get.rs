use pvac_api::{BitSet, PvStructure};

use super::ValueView;

/// Data returned by a get or by the get side of a put-get.
#[derive(Debug, Clone, PartialEq)]
pub struct GetData {
    channel: String,
    value: Option<PvStructure>,
    changed: BitSet,
}

impl GetData {
    pub(crate) fn new(channel: &str, shape: Option<PvStructure>) -> Self {
        Self {
            channel: channel.to_owned(),
            value: shape,
            changed: BitSet::new(),
        }
    }

    /// A one-shot get replaces the view wholesale.
    pub(crate) fn replace(&mut self, value: PvStructure, changed: BitSet) {
        self.value = Some(value);
        self.changed = changed;
    }
}

impl ValueView for GetData {
    fn channel_name(&self) -> &str {
        &self.channel
    }

    fn structure(&self) -> Option<&PvStructure> {
        self.value.as_ref()
    }

    fn changed_bitset(&self) -> &BitSet {
        &self.changed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pvac_api::value::nt::nt_scalar;
    use pvac_api::{Scalar, ScalarArray};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::CoreError;

    #[test]
    fn no_shape_is_no_data() {
        let data = GetData::new("pv", None);
        assert!(matches!(data.get_double(), Err(CoreError::NoData { .. })));
        assert!(!data.has_value());
    }

    #[test]
    fn typed_accessors() {
        let mut data = GetData::new("pv", None);
        data.replace(nt_scalar(Scalar::Int(7)), BitSet::whole());
        assert!(data.is_value_scalar());
        assert_eq!(data.get_double().unwrap(), 7.0);
        assert_eq!(data.get_string().unwrap(), "7");
        assert!(matches!(
            data.get_double_array(),
            Err(CoreError::TypeMismatch { .. })
        ));
        assert_eq!(data.alarm().unwrap().severity, 0);
        assert_eq!(data.changed_fields(), vec![String::new()]);
    }

    #[test]
    fn array_accessors() {
        let mut data = GetData::new("pv", None);
        let value = pvac_api::value::nt::nt_scalar_array(ScalarArray::from_doubles([1.0, 2.5]));
        data.replace(value, BitSet::whole());
        assert!(data.is_value_scalar_array());
        assert_eq!(data.get_double_array().unwrap(), vec![1.0, 2.5]);
        assert_eq!(data.get_string_array().unwrap(), vec!["1", "2.5"]);
        assert!(data.get_double().is_err());
    }

    #[test]
    fn show_changed_lists_fields() {
        let mut data = GetData::new("pv", None);
        let value = nt_scalar(Scalar::Double(1.5));
        let mut changed = BitSet::new();
        changed.set(value.offset_of("value").unwrap());
        changed.set(value.offset_of("alarm.severity").unwrap());
        data.replace(value, changed);
        insta::assert_snapshot!(data.show_changed(), @r"
        value = 1.5
        alarm.severity = 0
        ");
    }
}

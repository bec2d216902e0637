use pvac_api::{BitSet, PvField, PvStructure, Scalar, ScalarArray, convert_field};

use super::ValueView;
use crate::error::CoreError;

/// Data sent by a put or by the put side of a put-get.
///
/// Every write marks the field in the changed bitset; only marked fields
/// are sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PutData {
    channel: String,
    value: Option<PvStructure>,
    changed: BitSet,
}

impl PutData {
    pub(crate) fn new(channel: &str, shape: Option<PvStructure>) -> Self {
        Self {
            channel: channel.to_owned(),
            value: shape,
            changed: BitSet::new(),
        }
    }

    /// Fold a fetched value in field by field and OR its changed bits.
    pub(crate) fn merge(&mut self, value: &PvStructure, changed: &BitSet) -> Result<(), CoreError> {
        match self.value.as_mut() {
            Some(current) => current.copy_from(value)?,
            None => self.value = Some(value.clone()),
        }
        self.changed |= changed;
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Result<(PvStructure, BitSet), CoreError> {
        Ok((self.pv_structure()?.clone(), self.changed.clone()))
    }

    pub(crate) fn clear_changed(&mut self) {
        self.changed.clear_all();
    }

    /// Write `field` into `path`, converting to the field's declared type.
    pub fn put_field(&mut self, path: &str, field: impl Into<PvField>) -> Result<(), CoreError> {
        let channel = self.channel.clone();
        let target = self.value.as_mut().ok_or(CoreError::NoData {
            channel,
            operation: "put".into(),
        })?;
        let offset = target
            .offset_of(path)
            .ok_or_else(|| CoreError::FieldNotFound { field: path.into() })?;
        let dst = target
            .field_mut(path)
            .ok_or_else(|| CoreError::FieldNotFound { field: path.into() })?;
        *dst = convert_field(&field.into(), dst)?;
        self.changed.set(offset);
        Ok(())
    }

    pub fn put_double(&mut self, value: f64) -> Result<(), CoreError> {
        self.put_field("value", Scalar::Double(value))
    }

    pub fn put_string(&mut self, value: &str) -> Result<(), CoreError> {
        self.put_field("value", Scalar::from(value))
    }

    pub fn put_double_array(&mut self, values: &[f64]) -> Result<(), CoreError> {
        self.put_field("value", ScalarArray::from_doubles(values.iter().copied()))
    }

    pub fn put_string_array<S: AsRef<str>>(&mut self, values: &[S]) -> Result<(), CoreError> {
        self.put_field(
            "value",
            ScalarArray::from_strings(values.iter().map(AsRef::as_ref)),
        )
    }
}

impl ValueView for PutData {
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
    use pvac_api::value::nt::{nt_scalar, nt_scalar_array};

    use super::*;

    #[test]
    fn put_marks_value_changed() {
        let shape = nt_scalar(Scalar::Double(0.0));
        let mut data = PutData::new("pv", Some(shape.clone()));
        data.put_double(5.0).unwrap();
        assert_eq!(data.get_double().unwrap(), 5.0);
        assert!(data.changed_bitset().get(shape.offset_of("value").unwrap()));
        assert_eq!(data.changed_bitset().cardinality(), 1);
    }

    #[test]
    fn string_converts_into_numeric_value() {
        let mut data = PutData::new("pv", Some(nt_scalar(Scalar::Int(0))));
        data.put_string("42").unwrap();
        assert_eq!(data.get_double().unwrap(), 42.0);
        assert!(matches!(
            data.put_string("forty-two"),
            Err(CoreError::Incompatible { .. })
        ));
        assert_eq!(data.get_double().unwrap(), 42.0);
    }

    #[test]
    fn arrays() {
        let shape = nt_scalar_array(ScalarArray::from_doubles([]));
        let mut data = PutData::new("pv", Some(shape));
        data.put_string_array(&["1", "2"]).unwrap();
        assert_eq!(data.get_double_array().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn merge_ors_bitsets() {
        let shape = nt_scalar(Scalar::Double(0.0));
        let mut data = PutData::new("pv", Some(shape));
        data.put_double(1.0).unwrap();
        let mut fetched_bits = BitSet::new();
        fetched_bits.set(2);
        data.merge(&nt_scalar(Scalar::Double(3.0)), &fetched_bits)
            .unwrap();
        assert_eq!(data.get_double().unwrap(), 3.0);
        assert_eq!(data.changed_bitset().iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn no_shape_cannot_put() {
        let mut data = PutData::new("pv", None);
        assert!(matches!(data.put_double(1.0), Err(CoreError::NoData { .. })));
    }
}

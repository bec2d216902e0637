// ── Type-compatible conversion ──
//
// Conversions never mutate their destination: callers receive a new
// field and assign it only once the whole conversion succeeded.

use super::{PvField, Scalar, ScalarType};
use crate::error::Error;

#[derive(Clone, Copy)]
enum Number {
    Int(i128),
    Float(f64),
}

fn number_of(s: &Scalar) -> Option<Number> {
    Some(match *s {
        Scalar::Byte(v) => Number::Int(i128::from(v)),
        Scalar::Short(v) => Number::Int(i128::from(v)),
        Scalar::Int(v) => Number::Int(i128::from(v)),
        Scalar::Long(v) => Number::Int(i128::from(v)),
        Scalar::UByte(v) => Number::Int(i128::from(v)),
        Scalar::UShort(v) => Number::Int(i128::from(v)),
        Scalar::UInt(v) => Number::Int(i128::from(v)),
        Scalar::ULong(v) => Number::Int(i128::from(v)),
        Scalar::Float(v) => Number::Float(f64::from(v)),
        Scalar::Double(v) => Number::Float(v),
        Scalar::Boolean(_) | Scalar::String(_) => return None,
    })
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn number_to(n: Number, ty: ScalarType) -> Scalar {
    let int = || match n {
        Number::Int(v) => v,
        Number::Float(v) => v as i128,
    };
    let float = || match n {
        Number::Int(v) => v as f64,
        Number::Float(v) => v,
    };
    match ty {
        ScalarType::Byte => Scalar::Byte(int() as i8),
        ScalarType::Short => Scalar::Short(int() as i16),
        ScalarType::Int => Scalar::Int(int() as i32),
        ScalarType::Long => Scalar::Long(int() as i64),
        ScalarType::UByte => Scalar::UByte(int() as u8),
        ScalarType::UShort => Scalar::UShort(int() as u16),
        ScalarType::UInt => Scalar::UInt(int() as u32),
        ScalarType::ULong => Scalar::ULong(int() as u64),
        ScalarType::Float => Scalar::Float(float() as f32),
        ScalarType::Double => Scalar::Double(float()),
        ScalarType::Boolean | ScalarType::String => unreachable!("not a numeric type"),
    }
}

fn parse_number(text: &str, ty: ScalarType) -> Option<Scalar> {
    let t = text.trim();
    if ty.is_integer() {
        if let Ok(v) = t.parse::<i128>() {
            return Some(number_to(Number::Int(v), ty));
        }
    }
    t.parse::<f64>()
        .ok()
        .filter(|v| !ty.is_integer() || v.fract() == 0.0)
        .map(|v| number_to(Number::Float(v), ty))
}

pub(super) fn convert_scalar(src: &Scalar, ty: ScalarType) -> Result<Scalar, Error> {
    if src.scalar_type() == ty {
        return Ok(src.clone());
    }
    let incompatible = || Error::Incompatible {
        from: src.scalar_type().to_string(),
        to: ty.to_string(),
    };
    match (src, ty) {
        (_, ScalarType::String) => Ok(Scalar::String(src.to_string())),
        (Scalar::String(s), ScalarType::Boolean) => match s.trim() {
            "true" => Ok(Scalar::Boolean(true)),
            "false" => Ok(Scalar::Boolean(false)),
            _ => Err(Error::Incompatible {
                from: format!("string '{s}'"),
                to: ty.to_string(),
            }),
        },
        (Scalar::String(s), _) => parse_number(s, ty).ok_or_else(|| Error::Incompatible {
            from: format!("string '{s}'"),
            to: ty.to_string(),
        }),
        (Scalar::Boolean(_), _) | (_, ScalarType::Boolean) => Err(incompatible()),
        _ => number_of(src)
            .map(|n| number_to(n, ty))
            .ok_or_else(incompatible),
    }
}

/// Whether `src` could be copied into a field shaped like `dst`.
///
/// This is a type-level check: a string is considered compatible with a
/// numeric destination even though its content may still fail to parse.
/// Use [`convert_field`] for the value-level answer.
pub fn is_copy_compatible(src: &PvField, dst: &PvField) -> bool {
    let scalar_ok = |a: ScalarType, b: ScalarType| {
        a == b
            || b == ScalarType::String
            || a == ScalarType::String
            || (a.is_numeric() && b.is_numeric())
    };
    match (src, dst) {
        (_, PvField::Union(_)) | (PvField::UnionArray(_), PvField::UnionArray(_)) => true,
        (PvField::Union(Some(inner)), _) => is_copy_compatible(inner, dst),
        (PvField::Scalar(a), PvField::Scalar(b)) => scalar_ok(a.scalar_type(), b.scalar_type()),
        (PvField::ScalarArray(a), PvField::ScalarArray(b)) => {
            scalar_ok(a.element_type(), b.element_type())
        }
        (PvField::Structure(a), PvField::Structure(b)) => a
            .fields()
            .all(|(name, f)| b.field(name).is_some_and(|d| is_copy_compatible(f, d))),
        _ => false,
    }
}

/// Convert `src` into a new field shaped like `dst`.
///
/// Structures convert field by field; every field of `src` must exist in
/// `dst`. A union destination accepts anything.
pub fn convert_field(src: &PvField, dst: &PvField) -> Result<PvField, Error> {
    match (src, dst) {
        (PvField::Union(Some(inner)), PvField::Union(_)) => {
            Ok(PvField::Union(Some(inner.clone())))
        }
        (_, PvField::Union(_)) => Ok(PvField::Union(Some(Box::new(src.clone())))),
        (PvField::Union(Some(inner)), _) => convert_field(inner, dst),
        (PvField::UnionArray(items), PvField::UnionArray(_)) => {
            Ok(PvField::UnionArray(items.clone()))
        }
        (PvField::Scalar(a), PvField::Scalar(b)) => {
            Ok(PvField::Scalar(a.convert(b.scalar_type())?))
        }
        (PvField::ScalarArray(a), PvField::ScalarArray(b)) => {
            Ok(PvField::ScalarArray(a.convert(b.element_type())?))
        }
        (PvField::Structure(a), PvField::Structure(b)) => {
            let mut out = b.clone();
            for (name, field) in a.fields() {
                let target = out.field_mut(name).ok_or_else(|| Error::Incompatible {
                    from: format!("{} (field '{name}')", a.type_id()),
                    to: b.type_id().to_owned(),
                })?;
                *target = convert_field(field, target)?;
            }
            Ok(PvField::Structure(out))
        }
        _ => Err(Error::Incompatible {
            from: src.type_name(),
            to: dst.type_name(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::value::{PvStructure, ScalarArray};

    #[test]
    fn numeric_conversions() {
        assert_eq!(Scalar::Int(7).convert(ScalarType::Double).unwrap(), Scalar::Double(7.0));
        assert_eq!(Scalar::Double(3.9).convert(ScalarType::Int).unwrap(), Scalar::Int(3));
        assert_eq!(
            Scalar::Double(2.5).convert(ScalarType::String).unwrap(),
            Scalar::from("2.5")
        );
    }

    #[test]
    fn string_parsing() {
        assert_eq!(Scalar::from(" 12 ").convert(ScalarType::Long).unwrap(), Scalar::Long(12));
        assert_eq!(Scalar::from("1.25").convert(ScalarType::Float).unwrap(), Scalar::Float(1.25));
        assert_eq!(Scalar::from("true").convert(ScalarType::Boolean).unwrap(), Scalar::Boolean(true));
        assert!(Scalar::from("abc").convert(ScalarType::Double).is_err());
        assert!(Scalar::from("1.5").convert(ScalarType::Int).is_err());
    }

    #[test]
    fn boolean_and_numbers_do_not_mix() {
        assert!(Scalar::Boolean(true).convert(ScalarType::Int).is_err());
        assert!(Scalar::Int(1).convert(ScalarType::Boolean).is_err());
        assert!(!is_copy_compatible(
            &PvField::Scalar(Scalar::Boolean(true)),
            &PvField::Scalar(Scalar::Double(0.0))
        ));
    }

    #[test]
    fn scalar_and_array_are_incompatible() {
        let scalar = PvField::from(1.0);
        let array = PvField::from(ScalarArray::from_doubles([1.0]));
        assert!(!is_copy_compatible(&scalar, &array));
        assert!(convert_field(&array, &scalar).is_err());
    }

    #[test]
    fn structure_conversion_is_atomic() {
        let dst = PvField::from(
            PvStructure::new("")
                .with_field("a", Scalar::Int(1))
                .with_field("b", Scalar::Int(2)),
        );
        let src = PvField::from(
            PvStructure::new("")
                .with_field("a", Scalar::from("10"))
                .with_field("b", Scalar::from("oops")),
        );
        assert!(convert_field(&src, &dst).is_err());

        let good = PvField::from(PvStructure::new("").with_field("b", Scalar::Double(4.0)));
        let out = convert_field(&good, &dst).unwrap();
        let s = out.as_structure().unwrap();
        assert_eq!(s.scalar("a"), Some(&Scalar::Int(1)));
        assert_eq!(s.scalar("b"), Some(&Scalar::Int(4)));
    }

    #[test]
    fn union_accepts_anything() {
        let out = convert_field(&PvField::from(2.0), &PvField::Union(None)).unwrap();
        assert_eq!(out, PvField::Union(Some(Box::new(PvField::from(2.0)))));
        let back = convert_field(&out, &PvField::Scalar(Scalar::Int(0))).unwrap();
        assert_eq!(back, PvField::Scalar(Scalar::Int(2)));
    }
}

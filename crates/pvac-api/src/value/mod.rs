// ── Structured values ──
//
// A self-describing, tree-shaped value: scalars, scalar arrays, nested
// structures and variant unions. Fields are numbered depth-first, with
// offset 0 standing for the whole structure; changed/overrun bitsets are
// indexed by those offsets.

mod bitset;
mod convert;
pub mod nt;

use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::Error;
use crate::request::FieldSelection;

pub use bitset::BitSet;
pub use convert::{convert_field, is_copy_compatible};

// ── ScalarType ───────────────────────────────────────────────────

/// Element type of a scalar or scalar array.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    UByte,
    UShort,
    UInt,
    ULong,
    Float,
    Double,
    String,
}

impl ScalarType {
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Boolean | Self::String)
    }

    pub fn is_integer(self) -> bool {
        self.is_numeric() && !matches!(self, Self::Float | Self::Double)
    }
}

// ── Scalar ───────────────────────────────────────────────────────

/// A single typed value.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    UByte(u8),
    UShort(u16),
    UInt(u32),
    ULong(u64),
    Float(f32),
    Double(f64),
    String(String),
}

impl Scalar {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Boolean(_) => ScalarType::Boolean,
            Self::Byte(_) => ScalarType::Byte,
            Self::Short(_) => ScalarType::Short,
            Self::Int(_) => ScalarType::Int,
            Self::Long(_) => ScalarType::Long,
            Self::UByte(_) => ScalarType::UByte,
            Self::UShort(_) => ScalarType::UShort,
            Self::UInt(_) => ScalarType::UInt,
            Self::ULong(_) => ScalarType::ULong,
            Self::Float(_) => ScalarType::Float,
            Self::Double(_) => ScalarType::Double,
            Self::String(_) => ScalarType::String,
        }
    }

    /// The zero value of a scalar type.
    pub fn default_for(ty: ScalarType) -> Self {
        match ty {
            ScalarType::Boolean => Self::Boolean(false),
            ScalarType::Byte => Self::Byte(0),
            ScalarType::Short => Self::Short(0),
            ScalarType::Int => Self::Int(0),
            ScalarType::Long => Self::Long(0),
            ScalarType::UByte => Self::UByte(0),
            ScalarType::UShort => Self::UShort(0),
            ScalarType::UInt => Self::UInt(0),
            ScalarType::ULong => Self::ULong(0),
            ScalarType::Float => Self::Float(0.0),
            ScalarType::Double => Self::Double(0.0),
            ScalarType::String => Self::String(String::new()),
        }
    }

    /// Numeric value as `f64`. `None` for booleans and strings.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Byte(v) => Some(f64::from(v)),
            Self::Short(v) => Some(f64::from(v)),
            Self::Int(v) => Some(f64::from(v)),
            Self::Long(v) => Some(v as f64),
            Self::UByte(v) => Some(f64::from(v)),
            Self::UShort(v) => Some(f64::from(v)),
            Self::UInt(v) => Some(f64::from(v)),
            Self::ULong(v) => Some(v as f64),
            Self::Float(v) => Some(f64::from(v)),
            Self::Double(v) => Some(v),
            Self::Boolean(_) | Self::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Boolean(b) => Some(b),
            _ => None,
        }
    }

    /// Convert to another scalar type.
    ///
    /// Numeric types convert freely between each other; anything converts
    /// to string; strings parse into booleans and numbers. Booleans and
    /// numbers do not convert into each other.
    pub fn convert(&self, ty: ScalarType) -> Result<Self, Error> {
        convert::convert_scalar(self, ty)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Byte(v) => write!(f, "{v}"),
            Self::Short(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::UByte(v) => write!(f, "{v}"),
            Self::UShort(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::ULong(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

// ── ScalarArray ──────────────────────────────────────────────────

/// A homogeneous array of scalars.
///
/// Every element has `element_type`; constructors enforce it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarArray {
    element_type: ScalarType,
    elements: Vec<Scalar>,
}

impl ScalarArray {
    pub fn empty(element_type: ScalarType) -> Self {
        Self {
            element_type,
            elements: Vec::new(),
        }
    }

    /// Build from elements that must all be of `element_type`.
    pub fn new(element_type: ScalarType, elements: Vec<Scalar>) -> Result<Self, Error> {
        if let Some(bad) = elements.iter().find(|e| e.scalar_type() != element_type) {
            return Err(Error::TypeMismatch {
                field: "element".into(),
                expected: element_type.to_string(),
                found: bad.scalar_type().to_string(),
            });
        }
        Ok(Self {
            element_type,
            elements,
        })
    }

    pub fn from_doubles(values: impl IntoIterator<Item = f64>) -> Self {
        Self {
            element_type: ScalarType::Double,
            elements: values.into_iter().map(Scalar::Double).collect(),
        }
    }

    pub fn from_ints(values: impl IntoIterator<Item = i32>) -> Self {
        Self {
            element_type: ScalarType::Int,
            elements: values.into_iter().map(Scalar::Int).collect(),
        }
    }

    pub fn from_longs(values: impl IntoIterator<Item = i64>) -> Self {
        Self {
            element_type: ScalarType::Long,
            elements: values.into_iter().map(Scalar::Long).collect(),
        }
    }

    pub fn from_bools(values: impl IntoIterator<Item = bool>) -> Self {
        Self {
            element_type: ScalarType::Boolean,
            elements: values.into_iter().map(Scalar::Boolean).collect(),
        }
    }

    pub fn from_strings<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        Self {
            element_type: ScalarType::String,
            elements: values
                .into_iter()
                .map(|s| Scalar::String(s.into()))
                .collect(),
        }
    }

    pub fn element_type(&self) -> ScalarType {
        self.element_type
    }

    pub fn elements(&self) -> &[Scalar] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Scalar> {
        self.elements.get(index)
    }

    /// Elements as `f64`. Fails for boolean and string arrays.
    pub fn to_doubles(&self) -> Result<Vec<f64>, Error> {
        if !self.element_type.is_numeric() {
            return Err(Error::Incompatible {
                from: format!("{}[]", self.element_type),
                to: "double[]".into(),
            });
        }
        Ok(self.elements.iter().filter_map(Scalar::as_f64).collect())
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.elements.iter().map(ToString::to_string).collect()
    }

    /// Element-wise conversion; fails without producing a partial array.
    pub fn convert(&self, ty: ScalarType) -> Result<Self, Error> {
        if ty == self.element_type {
            return Ok(self.clone());
        }
        let elements = self
            .elements
            .iter()
            .map(|e| e.convert(ty))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            element_type: ty,
            elements,
        })
    }
}

impl fmt::Display for ScalarArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, e) in self.elements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{e}")?;
        }
        f.write_str("]")
    }
}

impl Serialize for ScalarArray {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(&self.elements)
    }
}

// ── PvField ──────────────────────────────────────────────────────

/// One node of a structured value.
#[derive(Debug, Clone, PartialEq)]
pub enum PvField {
    Scalar(Scalar),
    ScalarArray(ScalarArray),
    Structure(PvStructure),
    /// Variant union: holds any field, or nothing.
    Union(Option<Box<PvField>>),
    /// Array of variant unions.
    UnionArray(Vec<Option<PvField>>),
}

impl PvField {
    /// Human-readable type, e.g. `double`, `string[]`, `alarm_t`, `any`.
    pub fn type_name(&self) -> String {
        match self {
            Self::Scalar(s) => s.scalar_type().to_string(),
            Self::ScalarArray(a) => format!("{}[]", a.element_type()),
            Self::Structure(s) => s.type_id().to_owned(),
            Self::Union(_) => "any".into(),
            Self::UnionArray(_) => "any[]".into(),
        }
    }

    /// Number of offsets this field occupies (itself plus descendants).
    pub fn num_fields(&self) -> usize {
        match self {
            Self::Structure(s) => s.num_fields(),
            _ => 1,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_scalar_array(&self) -> Option<&ScalarArray> {
        match self {
            Self::ScalarArray(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&PvStructure> {
        match self {
            Self::Structure(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_structure_mut(&mut self) -> Option<&mut PvStructure> {
        match self {
            Self::Structure(s) => Some(s),
            _ => None,
        }
    }

    /// The content of a variant union, or the field itself otherwise.
    pub fn unwrap_union(&self) -> Option<&PvField> {
        match self {
            Self::Union(inner) => inner.as_deref(),
            other => Some(other),
        }
    }

    fn fmt_tree(&self, name: &str, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indent = "    ".repeat(depth);
        match self {
            Self::Scalar(s) => writeln!(f, "{indent}{} {name} {s}", s.scalar_type()),
            Self::ScalarArray(a) => writeln!(f, "{indent}{}[] {name} {a}", a.element_type()),
            Self::Structure(s) => {
                writeln!(f, "{indent}{} {name}", s.type_id())?;
                s.fmt_fields(depth + 1, f)
            }
            Self::Union(None) => writeln!(f, "{indent}any {name} (none)"),
            Self::Union(Some(inner)) => {
                writeln!(f, "{indent}any {name}")?;
                inner.fmt_tree("", depth + 1, f)
            }
            Self::UnionArray(items) => {
                writeln!(f, "{indent}any[] {name}")?;
                for (i, item) in items.iter().enumerate() {
                    match item {
                        Some(inner) => inner.fmt_tree(&format!("[{i}]"), depth + 1, f)?,
                        None => writeln!(f, "{}any [{i}] (none)", "    ".repeat(depth + 1))?,
                    }
                }
                Ok(())
            }
        }
    }
}

impl From<Scalar> for PvField {
    fn from(v: Scalar) -> Self {
        Self::Scalar(v)
    }
}

impl From<ScalarArray> for PvField {
    fn from(v: ScalarArray) -> Self {
        Self::ScalarArray(v)
    }
}

impl From<PvStructure> for PvField {
    fn from(v: PvStructure) -> Self {
        Self::Structure(v)
    }
}

impl From<f64> for PvField {
    fn from(v: f64) -> Self {
        Self::Scalar(Scalar::Double(v))
    }
}

impl From<i32> for PvField {
    fn from(v: i32) -> Self {
        Self::Scalar(Scalar::from(v))
    }
}

impl From<i64> for PvField {
    fn from(v: i64) -> Self {
        Self::Scalar(Scalar::from(v))
    }
}

impl From<bool> for PvField {
    fn from(v: bool) -> Self {
        Self::Scalar(Scalar::from(v))
    }
}

impl From<&str> for PvField {
    fn from(v: &str) -> Self {
        Self::Scalar(Scalar::from(v))
    }
}

impl From<String> for PvField {
    fn from(v: String) -> Self {
        Self::Scalar(Scalar::from(v))
    }
}

impl Serialize for PvField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Scalar(s) => s.serialize(serializer),
            Self::ScalarArray(a) => a.serialize(serializer),
            Self::Structure(s) => s.serialize(serializer),
            Self::Union(inner) => inner.serialize(serializer),
            Self::UnionArray(items) => serializer.collect_seq(items),
        }
    }
}

// ── PvStructure ──────────────────────────────────────────────────

/// An ordered set of named fields with an optional type id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PvStructure {
    id: String,
    fields: Vec<(String, PvField)>,
}

impl PvStructure {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Vec::new(),
        }
    }

    /// Builder-style [`add_field`](Self::add_field).
    pub fn with_field(mut self, name: impl Into<String>, field: impl Into<PvField>) -> Self {
        self.add_field(name, field);
        self
    }

    /// Append a field, replacing any existing field of the same name.
    pub fn add_field(&mut self, name: impl Into<String>, field: impl Into<PvField>) {
        let name = name.into();
        let field = field.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = field;
        } else {
            self.fields.push((name, field));
        }
    }

    /// The declared id; empty for anonymous structures.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The id, or `structure` for anonymous structures.
    pub fn type_id(&self) -> &str {
        if self.id.is_empty() { "structure" } else { &self.id }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &PvField)> {
        self.fields.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolve a dotted path such as `alarm.severity`.
    pub fn field(&self, path: &str) -> Option<&PvField> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut field = self.direct(first)?;
        for seg in segments {
            field = field.as_structure()?.direct(seg)?;
        }
        Some(field)
    }

    pub fn field_mut(&mut self, path: &str) -> Option<&mut PvField> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut field = self.direct_mut(first)?;
        for seg in segments {
            field = field.as_structure_mut()?.direct_mut(seg)?;
        }
        Some(field)
    }

    pub fn scalar(&self, path: &str) -> Option<&Scalar> {
        self.field(path)?.as_scalar()
    }

    pub fn structure(&self, path: &str) -> Option<&PvStructure> {
        self.field(path)?.as_structure()
    }

    /// Field path if present with the expected kind, as a typed error otherwise.
    pub fn require(&self, path: &str) -> Result<&PvField, Error> {
        self.field(path)
            .ok_or_else(|| Error::FieldNotFound(path.to_owned()))
    }

    fn direct(&self, name: &str) -> Option<&PvField> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    fn direct_mut(&mut self, name: &str) -> Option<&mut PvField> {
        self.fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    // ── Offsets ──────────────────────────────────────────────────

    /// Number of offsets: this structure plus every descendant.
    pub fn num_fields(&self) -> usize {
        1 + self.fields.iter().map(|(_, f)| f.num_fields()).sum::<usize>()
    }

    /// Depth-first offset of a dotted path; `""` is offset 0.
    pub fn offset_of(&self, path: &str) -> Option<usize> {
        if path.is_empty() {
            return Some(0);
        }
        let mut offset = 0;
        let mut current = self;
        let mut segments = path.split('.').peekable();
        while let Some(seg) = segments.next() {
            let mut next = offset + 1;
            let mut found = None;
            for (name, field) in &current.fields {
                if name == seg {
                    found = Some(field);
                    break;
                }
                next += field.num_fields();
            }
            let field = found?;
            offset = next;
            if segments.peek().is_some() {
                current = field.as_structure()?;
            }
        }
        Some(offset)
    }

    /// Dotted path of an offset; offset 0 is `""`.
    pub fn path_of(&self, offset: usize) -> Option<String> {
        if offset == 0 {
            return Some(String::new());
        }
        if offset >= self.num_fields() {
            return None;
        }
        let mut path: Vec<&str> = Vec::new();
        let mut current = self;
        let mut base = 0;
        loop {
            let mut next = base + 1;
            let mut descend = None;
            for (name, field) in &current.fields {
                let width = field.num_fields();
                if offset == next {
                    path.push(name);
                    return Some(path.join("."));
                }
                if offset < next + width {
                    descend = Some((name.as_str(), field, next));
                    break;
                }
                next += width;
            }
            let (name, field, start) = descend?;
            path.push(name);
            current = field.as_structure()?;
            base = start;
        }
    }

    /// Paths of every leaf (non-structure) field, depth-first.
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_leaves("", &mut out);
        out
    }

    fn collect_leaves(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, field) in &self.fields {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            match field {
                PvField::Structure(s) => s.collect_leaves(&path, out),
                _ => out.push(path),
            }
        }
    }

    // ── Selection / copy ─────────────────────────────────────────

    /// Project onto the fields named by a selection, preserving field order.
    pub fn select(&self, selection: &FieldSelection) -> Result<Self, Error> {
        if selection.is_all() {
            return Ok(self.clone());
        }
        for (name, _) in selection.entries() {
            if self.direct(name).is_none() {
                return Err(Error::FieldNotFound(name.to_owned()));
            }
        }
        let mut out = Self::new(self.id.clone());
        for (name, field) in &self.fields {
            let Some(child) = selection.child(name) else {
                continue;
            };
            let selected = if child.is_all() {
                field.clone()
            } else if let PvField::Structure(s) = field {
                PvField::Structure(s.select(child)?)
            } else {
                return Err(Error::TypeMismatch {
                    field: name.clone(),
                    expected: "structure".into(),
                    found: field.type_name(),
                });
            };
            out.fields.push((name.clone(), selected));
        }
        Ok(out)
    }

    /// Copy every field of `src` that also exists here, converting types.
    ///
    /// Fields present only in `src` are ignored. Conversion failures leave
    /// already-copied fields in place.
    pub fn copy_from(&mut self, src: &Self) -> Result<(), Error> {
        for (name, field) in &src.fields {
            if let Some(dst) = self.direct_mut(name) {
                *dst = convert_field(field, dst)?;
            }
        }
        Ok(())
    }

    /// JSON rendering of the value tree.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn fmt_fields(&self, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, field) in &self.fields {
            field.fmt_tree(name, depth, f)?;
        }
        Ok(())
    }
}

impl fmt::Display for PvStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.type_id())?;
        self.fmt_fields(1, f)
    }
}

impl Serialize for PvStructure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, field) in &self.fields {
            map.serialize_entry(name, field)?;
        }
        map.end()
    }
}

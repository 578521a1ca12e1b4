//! Structured values
//!
//! A [`PvStructure`] pairs a shared [`Structure`] descriptor with data for
//! every node. Fields are addressed by dotted path (`alarm.severity`) or by
//! their pre-order offset, which is what dirty-field masks refer to.

use std::fmt;
use std::sync::Arc;

use super::{BitSet, Field, PvDataError, PvDataResult, ScalarType, Structure};

/// One scalar datum
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
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

impl ScalarValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::Boolean(_) => ScalarType::Boolean,
            ScalarValue::Byte(_) => ScalarType::Byte,
            ScalarValue::Short(_) => ScalarType::Short,
            ScalarValue::Int(_) => ScalarType::Int,
            ScalarValue::Long(_) => ScalarType::Long,
            ScalarValue::UByte(_) => ScalarType::UByte,
            ScalarValue::UShort(_) => ScalarType::UShort,
            ScalarValue::UInt(_) => ScalarType::UInt,
            ScalarValue::ULong(_) => ScalarType::ULong,
            ScalarValue::Float(_) => ScalarType::Float,
            ScalarValue::Double(_) => ScalarType::Double,
            ScalarValue::String(_) => ScalarType::String,
        }
    }

    /// Zero value of a type
    pub fn default_for(scalar_type: ScalarType) -> Self {
        match scalar_type {
            ScalarType::Boolean => ScalarValue::Boolean(false),
            ScalarType::Byte => ScalarValue::Byte(0),
            ScalarType::Short => ScalarValue::Short(0),
            ScalarType::Int => ScalarValue::Int(0),
            ScalarType::Long => ScalarValue::Long(0),
            ScalarType::UByte => ScalarValue::UByte(0),
            ScalarType::UShort => ScalarValue::UShort(0),
            ScalarType::UInt => ScalarValue::UInt(0),
            ScalarType::ULong => ScalarValue::ULong(0),
            ScalarType::Float => ScalarValue::Float(0.0),
            ScalarType::Double => ScalarValue::Double(0.0),
            ScalarType::String => ScalarValue::String(String::new()),
        }
    }

    /// Parse text as a value of the given type
    pub fn parse(scalar_type: ScalarType, text: &str) -> PvDataResult<Self> {
        let err = || PvDataError::Parse {
            text: text.to_string(),
            scalar_type: scalar_type.name().to_string(),
        };
        let trimmed = text.trim();
        let value = match scalar_type {
            ScalarType::Boolean => match trimmed {
                "true" | "1" => ScalarValue::Boolean(true),
                "false" | "0" => ScalarValue::Boolean(false),
                _ => return Err(err()),
            },
            ScalarType::Byte => ScalarValue::Byte(trimmed.parse().map_err(|_| err())?),
            ScalarType::Short => ScalarValue::Short(trimmed.parse().map_err(|_| err())?),
            ScalarType::Int => ScalarValue::Int(trimmed.parse().map_err(|_| err())?),
            ScalarType::Long => ScalarValue::Long(trimmed.parse().map_err(|_| err())?),
            ScalarType::UByte => ScalarValue::UByte(trimmed.parse().map_err(|_| err())?),
            ScalarType::UShort => ScalarValue::UShort(trimmed.parse().map_err(|_| err())?),
            ScalarType::UInt => ScalarValue::UInt(trimmed.parse().map_err(|_| err())?),
            ScalarType::ULong => ScalarValue::ULong(trimmed.parse().map_err(|_| err())?),
            ScalarType::Float => ScalarValue::Float(trimmed.parse().map_err(|_| err())?),
            ScalarType::Double => ScalarValue::Double(trimmed.parse().map_err(|_| err())?),
            ScalarType::String => ScalarValue::String(text.to_string()),
        };
        Ok(value)
    }

    /// Numeric view, if the value is numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Byte(v) => Some(*v as f64),
            ScalarValue::Short(v) => Some(*v as f64),
            ScalarValue::Int(v) => Some(*v as f64),
            ScalarValue::Long(v) => Some(*v as f64),
            ScalarValue::UByte(v) => Some(*v as f64),
            ScalarValue::UShort(v) => Some(*v as f64),
            ScalarValue::UInt(v) => Some(*v as f64),
            ScalarValue::ULong(v) => Some(*v as f64),
            ScalarValue::Float(v) => Some(*v as f64),
            ScalarValue::Double(v) => Some(*v),
            ScalarValue::Boolean(_) | ScalarValue::String(_) => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Boolean(v) => write!(f, "{}", v),
            ScalarValue::Byte(v) => write!(f, "{}", v),
            ScalarValue::Short(v) => write!(f, "{}", v),
            ScalarValue::Int(v) => write!(f, "{}", v),
            ScalarValue::Long(v) => write!(f, "{}", v),
            ScalarValue::UByte(v) => write!(f, "{}", v),
            ScalarValue::UShort(v) => write!(f, "{}", v),
            ScalarValue::UInt(v) => write!(f, "{}", v),
            ScalarValue::ULong(v) => write!(f, "{}", v),
            ScalarValue::Float(v) => write!(f, "{}", v),
            ScalarValue::Double(v) => write!(f, "{}", v),
            ScalarValue::String(v) => write!(f, "{}", v),
        }
    }
}

/// Data for one node of a structured value
#[derive(Debug, Clone, PartialEq)]
pub enum PvField {
    Scalar(ScalarValue),
    Array(Vec<ScalarValue>),
    Structure(PvStructure),
}

impl PvField {
    /// Default data for a descriptor
    pub fn from_field(field: &Field) -> Self {
        match field {
            Field::Scalar(t) => PvField::Scalar(ScalarValue::default_for(*t)),
            Field::ScalarArray(_) => PvField::Array(Vec::new()),
            Field::Structure(s) => PvField::Structure(PvStructure::new(s.clone())),
        }
    }
}

/// A structured value
#[derive(Debug, Clone, PartialEq)]
pub struct PvStructure {
    structure: Arc<Structure>,
    fields: Vec<PvField>,
}

impl PvStructure {
    /// Value with every field at its default
    pub fn new(structure: Arc<Structure>) -> Self {
        let fields = structure
            .fields()
            .iter()
            .map(|(_, f)| PvField::from_field(f))
            .collect();
        Self { structure, fields }
    }

    pub fn structure(&self) -> &Arc<Structure> {
        &self.structure
    }

    pub fn fields(&self) -> &[PvField] {
        &self.fields
    }

    pub(crate) fn fields_mut(&mut self) -> &mut [PvField] {
        &mut self.fields
    }

    pub fn get(&self, path: &str) -> Option<&PvField> {
        let (head, rest) = split_path(path);
        let index = self.structure.index_of(head)?;
        let field = &self.fields[index];
        match (rest, field) {
            (None, f) => Some(f),
            (Some(rest), PvField::Structure(sub)) => sub.get(rest),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut PvField> {
        let (head, rest) = split_path(path);
        let index = self.structure.index_of(head)?;
        let field = &mut self.fields[index];
        match (rest, field) {
            (None, f) => Some(f),
            (Some(rest), PvField::Structure(sub)) => sub.get_mut(rest),
            _ => None,
        }
    }

    pub fn scalar(&self, path: &str) -> Option<&ScalarValue> {
        match self.get(path)? {
            PvField::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Set a scalar field and return its offset for use in a change mask
    pub fn set(&mut self, path: &str, value: ScalarValue) -> PvDataResult<usize> {
        let offset = self.scalar_offset(path, value.scalar_type())?;
        if let Some(PvField::Scalar(slot)) = self.get_mut(path) {
            *slot = value;
        }
        Ok(offset)
    }

    /// Replace a scalar array field and return its offset
    pub fn set_array(&mut self, path: &str, values: Vec<ScalarValue>) -> PvDataResult<usize> {
        let Some(Field::ScalarArray(element)) = self.structure.field_at(path) else {
            return Err(self.lookup_error(path, "array"));
        };
        let element = *element;
        if let Some(bad) = values.iter().find(|v| v.scalar_type() != element) {
            return Err(PvDataError::TypeMismatch {
                path: path.to_string(),
                expected: element.name().to_string(),
                found: bad.scalar_type().name().to_string(),
            });
        }
        let offset = self
            .structure
            .offset_of(path)
            .ok_or_else(|| PvDataError::NoSuchField(path.to_string()))?;
        if let Some(PvField::Array(slot)) = self.get_mut(path) {
            *slot = values;
        }
        Ok(offset)
    }

    fn scalar_offset(&self, path: &str, found: ScalarType) -> PvDataResult<usize> {
        match self.structure.field_at(path) {
            Some(Field::Scalar(expected)) if *expected == found => self
                .structure
                .offset_of(path)
                .ok_or_else(|| PvDataError::NoSuchField(path.to_string())),
            Some(Field::Scalar(expected)) => Err(PvDataError::TypeMismatch {
                path: path.to_string(),
                expected: expected.name().to_string(),
                found: found.name().to_string(),
            }),
            _ => Err(self.lookup_error(path, found.name())),
        }
    }

    fn lookup_error(&self, path: &str, wanted: &str) -> PvDataError {
        match self.structure.field_at(path) {
            None => PvDataError::NoSuchField(path.to_string()),
            Some(field) => PvDataError::TypeMismatch {
                path: path.to_string(),
                expected: field.type_name(),
                found: wanted.to_string(),
            },
        }
    }

    /// Copy every field selected by `mask` from `source`.
    ///
    /// Both values must share the same descriptor. A set structure bit
    /// copies the whole subtree.
    pub fn copy_masked_from(&mut self, source: &PvStructure, mask: &BitSet) -> PvDataResult<()> {
        if self.structure != source.structure {
            return Err(PvDataError::StructureMismatch {
                expected: self.structure.id().to_string(),
                found: source.structure.id().to_string(),
            });
        }
        self.copy_masked_at(source, mask, 0);
        Ok(())
    }

    fn copy_masked_at(&mut self, source: &PvStructure, mask: &BitSet, offset: usize) {
        let end = offset + self.structure.field_count();
        if !mask.any_in(offset, end) {
            return;
        }
        if mask.get(offset) {
            self.fields.clone_from(&source.fields);
            return;
        }
        let mut child = offset + 1;
        for ((_, desc), (dst, src)) in self
            .structure
            .fields()
            .iter()
            .zip(self.fields.iter_mut().zip(&source.fields))
        {
            match (dst, src) {
                (PvField::Structure(d), PvField::Structure(s)) => d.copy_masked_at(s, mask, child),
                (dst, src) => {
                    if mask.get(child) {
                        dst.clone_from(src);
                    }
                }
            }
            child += desc.field_count();
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        for ((name, desc), value) in self.structure.fields().iter().zip(&self.fields) {
            let indent = "    ".repeat(depth);
            match value {
                PvField::Scalar(v) => writeln!(f, "{}{} {} {}", indent, desc.type_name(), name, v)?,
                PvField::Array(values) => {
                    let joined: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                    writeln!(f, "{}{} {} [{}]", indent, desc.type_name(), name, joined.join(","))?
                }
                PvField::Structure(sub) => {
                    writeln!(f, "{}{} {}", indent, desc.type_name(), name)?;
                    sub.fmt_indented(f, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

impl fmt::Display for PvStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.structure.id())?;
        self.fmt_indented(f, 1)
    }
}

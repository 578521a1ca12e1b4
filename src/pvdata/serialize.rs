//! Value encoding
//!
//! Full encoding writes every field in pre-order. Masked encoding writes only
//! the fields whose bit is set in a change mask; a set structure bit stands
//! for its whole subtree. Both sides must agree on the descriptor, which is
//! exchanged separately through the [`IntrospectionRegistry`].
//!
//! [`IntrospectionRegistry`]: super::IntrospectionRegistry

use bytes::{Buf, BufMut};
use std::sync::Arc;

use crate::protocol::{ensure, get_u8, read_size, read_string, write_size, write_string, CodecError};

use super::{BitSet, Field, PvField, PvStructure, ScalarType, ScalarValue, Structure};

impl ScalarValue {
    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        match self {
            ScalarValue::Boolean(v) => buf.put_u8(*v as u8),
            ScalarValue::Byte(v) => buf.put_i8(*v),
            ScalarValue::Short(v) => buf.put_i16(*v),
            ScalarValue::Int(v) => buf.put_i32(*v),
            ScalarValue::Long(v) => buf.put_i64(*v),
            ScalarValue::UByte(v) => buf.put_u8(*v),
            ScalarValue::UShort(v) => buf.put_u16(*v),
            ScalarValue::UInt(v) => buf.put_u32(*v),
            ScalarValue::ULong(v) => buf.put_u64(*v),
            ScalarValue::Float(v) => buf.put_f32(*v),
            ScalarValue::Double(v) => buf.put_f64(*v),
            ScalarValue::String(v) => write_string(buf, v),
        }
    }

    pub fn deserialize<B: Buf>(scalar_type: ScalarType, buf: &mut B) -> Result<Self, CodecError> {
        let value = match scalar_type {
            ScalarType::Boolean => ScalarValue::Boolean(get_u8(buf)? != 0),
            ScalarType::Byte => {
                ensure(buf, 1)?;
                ScalarValue::Byte(buf.get_i8())
            }
            ScalarType::Short => {
                ensure(buf, 2)?;
                ScalarValue::Short(buf.get_i16())
            }
            ScalarType::Int => {
                ensure(buf, 4)?;
                ScalarValue::Int(buf.get_i32())
            }
            ScalarType::Long => {
                ensure(buf, 8)?;
                ScalarValue::Long(buf.get_i64())
            }
            ScalarType::UByte => ScalarValue::UByte(get_u8(buf)?),
            ScalarType::UShort => {
                ensure(buf, 2)?;
                ScalarValue::UShort(buf.get_u16())
            }
            ScalarType::UInt => {
                ensure(buf, 4)?;
                ScalarValue::UInt(buf.get_u32())
            }
            ScalarType::ULong => {
                ensure(buf, 8)?;
                ScalarValue::ULong(buf.get_u64())
            }
            ScalarType::Float => {
                ensure(buf, 4)?;
                ScalarValue::Float(buf.get_f32())
            }
            ScalarType::Double => {
                ensure(buf, 8)?;
                ScalarValue::Double(buf.get_f64())
            }
            ScalarType::String => ScalarValue::String(read_string(buf)?),
        };
        Ok(value)
    }
}

fn mismatch(desc: &Field, found: &str) -> CodecError {
    CodecError::TypeMismatch(format!("expected {}, found {}", desc.type_name(), found))
}

/// Encode one field's data against its descriptor
pub fn serialize_field<B: BufMut>(
    value: &PvField,
    desc: &Field,
    buf: &mut B,
) -> Result<(), CodecError> {
    match (desc, value) {
        (Field::Scalar(t), PvField::Scalar(v)) if v.scalar_type() == *t => {
            v.serialize(buf);
            Ok(())
        }
        (Field::ScalarArray(t), PvField::Array(values)) => {
            if let Some(bad) = values.iter().find(|v| v.scalar_type() != *t) {
                return Err(mismatch(desc, bad.scalar_type().name()));
            }
            write_size(buf, values.len());
            for v in values {
                v.serialize(buf);
            }
            Ok(())
        }
        (Field::Structure(s), PvField::Structure(sub)) if s == sub.structure() => sub.serialize(buf),
        (_, PvField::Scalar(v)) => Err(mismatch(desc, v.scalar_type().name())),
        (_, PvField::Array(_)) => Err(mismatch(desc, "array")),
        (_, PvField::Structure(sub)) => Err(mismatch(desc, sub.structure().id())),
    }
}

/// Decode one field's data for a descriptor
pub fn deserialize_field<B: Buf>(desc: &Field, buf: &mut B) -> Result<PvField, CodecError> {
    match desc {
        Field::Scalar(t) => Ok(PvField::Scalar(ScalarValue::deserialize(*t, buf)?)),
        Field::ScalarArray(t) => {
            let len = read_size(buf)?;
            // each element takes at least one byte
            ensure(buf, len)?;
            let mut values = Vec::with_capacity(len);
            for _ in 0..len {
                values.push(ScalarValue::deserialize(*t, buf)?);
            }
            Ok(PvField::Array(values))
        }
        Field::Structure(s) => Ok(PvField::Structure(PvStructure::deserialize(s.clone(), buf)?)),
    }
}

impl PvStructure {
    /// Encode every field
    pub fn serialize<B: BufMut>(&self, buf: &mut B) -> Result<(), CodecError> {
        for ((_, desc), value) in self.structure().fields().iter().zip(self.fields()) {
            serialize_field(value, desc, buf)?;
        }
        Ok(())
    }

    /// Decode a complete value of the given shape
    pub fn deserialize<B: Buf>(structure: Arc<Structure>, buf: &mut B) -> Result<Self, CodecError> {
        let mut value = PvStructure::new(structure);
        value.deserialize_in_place(buf)?;
        Ok(value)
    }

    fn deserialize_in_place<B: Buf>(&mut self, buf: &mut B) -> Result<(), CodecError> {
        let structure = self.structure().clone();
        for ((_, desc), slot) in structure.fields().iter().zip(self.fields_mut()) {
            *slot = deserialize_field(desc, buf)?;
        }
        Ok(())
    }

    /// Encode only the fields selected by `mask`, in pre-order
    pub fn serialize_masked<B: BufMut>(&self, mask: &BitSet, buf: &mut B) -> Result<(), CodecError> {
        self.serialize_masked_at(mask, 0, buf)
    }

    fn serialize_masked_at<B: BufMut>(
        &self,
        mask: &BitSet,
        offset: usize,
        buf: &mut B,
    ) -> Result<(), CodecError> {
        if !mask.any_in(offset, offset + self.structure().field_count()) {
            return Ok(());
        }
        if mask.get(offset) {
            return self.serialize(buf);
        }
        let mut child = offset + 1;
        for ((_, desc), value) in self.structure().fields().iter().zip(self.fields()) {
            match value {
                PvField::Structure(sub) => sub.serialize_masked_at(mask, child, buf)?,
                other => {
                    if mask.get(child) {
                        serialize_field(other, desc, buf)?;
                    }
                }
            }
            child += desc.field_count();
        }
        Ok(())
    }

    /// Decode the fields selected by `mask` into this value; others are untouched
    pub fn deserialize_masked<B: Buf>(&mut self, mask: &BitSet, buf: &mut B) -> Result<(), CodecError> {
        self.deserialize_masked_at(mask, 0, buf)
    }

    fn deserialize_masked_at<B: Buf>(
        &mut self,
        mask: &BitSet,
        offset: usize,
        buf: &mut B,
    ) -> Result<(), CodecError> {
        let structure = self.structure().clone();
        if !mask.any_in(offset, offset + structure.field_count()) {
            return Ok(());
        }
        if mask.get(offset) {
            return self.deserialize_in_place(buf);
        }
        let mut child = offset + 1;
        for ((_, desc), slot) in structure.fields().iter().zip(self.fields_mut()) {
            match slot {
                PvField::Structure(sub) => sub.deserialize_masked_at(mask, child, buf)?,
                other => {
                    if mask.get(child) {
                        *other = deserialize_field(desc, buf)?;
                    }
                }
            }
            child += desc.field_count();
        }
        Ok(())
    }
}

/// Write a change mask followed by the masked fields
pub fn serialize_changed<B: BufMut>(
    value: &PvStructure,
    changed: &BitSet,
    buf: &mut B,
) -> Result<(), CodecError> {
    changed.serialize(buf);
    value.serialize_masked(changed, buf)
}

/// Read a change mask and apply the fields it selects to `target`
pub fn deserialize_changed<B: Buf>(target: &mut PvStructure, buf: &mut B) -> Result<BitSet, CodecError> {
    let changed = BitSet::deserialize(buf)?;
    target.deserialize_masked(&changed, buf)?;
    Ok(changed)
}

//! Type descriptors
//!
//! A descriptor is the shape of a value without its data. Structures are
//! shared behind `Arc` so values and caches can hold them cheaply.

use bytes::{Buf, BufMut};
use std::fmt;
use std::sync::Arc;

use crate::protocol::{get_u8, read_size, read_string, write_size, write_string, CodecError};

/// Flag bit marking a variable-size scalar array type code
pub const ARRAY_FLAG: u8 = 0x08;

/// Type code of a structure descriptor
pub const STRUCTURE_CODE: u8 = 0x80;

/// Deepest structure nesting accepted when decoding a descriptor
pub const MAX_NESTING_DEPTH: usize = 64;

/// Scalar element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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
    pub fn type_code(self) -> u8 {
        match self {
            ScalarType::Boolean => 0x00,
            ScalarType::Byte => 0x20,
            ScalarType::Short => 0x21,
            ScalarType::Int => 0x22,
            ScalarType::Long => 0x23,
            ScalarType::UByte => 0x24,
            ScalarType::UShort => 0x25,
            ScalarType::UInt => 0x26,
            ScalarType::ULong => 0x27,
            ScalarType::Float => 0x42,
            ScalarType::Double => 0x43,
            ScalarType::String => 0x60,
        }
    }

    pub fn from_type_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ScalarType::Boolean),
            0x20 => Some(ScalarType::Byte),
            0x21 => Some(ScalarType::Short),
            0x22 => Some(ScalarType::Int),
            0x23 => Some(ScalarType::Long),
            0x24 => Some(ScalarType::UByte),
            0x25 => Some(ScalarType::UShort),
            0x26 => Some(ScalarType::UInt),
            0x27 => Some(ScalarType::ULong),
            0x42 => Some(ScalarType::Float),
            0x43 => Some(ScalarType::Double),
            0x60 => Some(ScalarType::String),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Boolean => "boolean",
            ScalarType::Byte => "byte",
            ScalarType::Short => "short",
            ScalarType::Int => "int",
            ScalarType::Long => "long",
            ScalarType::UByte => "ubyte",
            ScalarType::UShort => "ushort",
            ScalarType::UInt => "uint",
            ScalarType::ULong => "ulong",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
            ScalarType::String => "string",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let all = [
            ScalarType::Boolean,
            ScalarType::Byte,
            ScalarType::Short,
            ScalarType::Int,
            ScalarType::Long,
            ScalarType::UByte,
            ScalarType::UShort,
            ScalarType::UInt,
            ScalarType::ULong,
            ScalarType::Float,
            ScalarType::Double,
            ScalarType::String,
        ];
        all.into_iter().find(|t| t.name() == name)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape of one node in a structured value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Scalar(ScalarType),
    ScalarArray(ScalarType),
    Structure(Arc<Structure>),
}

impl Field {
    /// Number of nodes this field occupies in a pre-order traversal
    pub fn field_count(&self) -> usize {
        match self {
            Field::Scalar(_) | Field::ScalarArray(_) => 1,
            Field::Structure(s) => s.field_count(),
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Field::Scalar(t) => t.name().to_string(),
            Field::ScalarArray(t) => format!("{}[]", t.name()),
            Field::Structure(s) => s.id().to_string(),
        }
    }

    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        match self {
            Field::Scalar(t) => buf.put_u8(t.type_code()),
            Field::ScalarArray(t) => buf.put_u8(t.type_code() | ARRAY_FLAG),
            Field::Structure(s) => s.serialize(buf),
        }
    }

    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Field, CodecError> {
        let code = get_u8(buf)?;
        Self::deserialize_with_code(code, buf)
    }

    /// Continue decoding a descriptor whose type code was already consumed
    pub fn deserialize_with_code<B: Buf>(code: u8, buf: &mut B) -> Result<Field, CodecError> {
        Self::deserialize_nested(code, buf, 0)
    }

    fn deserialize_nested<B: Buf>(code: u8, buf: &mut B, depth: usize) -> Result<Field, CodecError> {
        if code == STRUCTURE_CODE {
            if depth >= MAX_NESTING_DEPTH {
                return Err(CodecError::Invalid(
                    "descriptor nested too deeply".to_string(),
                ));
            }
            let body = Structure::deserialize_body(buf, depth + 1)?;
            return Ok(Field::Structure(Arc::new(body)));
        }
        if let Some(t) = ScalarType::from_type_code(code) {
            return Ok(Field::Scalar(t));
        }
        if code & ARRAY_FLAG != 0 {
            if let Some(t) = ScalarType::from_type_code(code & !ARRAY_FLAG) {
                return Ok(Field::ScalarArray(t));
            }
        }
        Err(CodecError::UnknownTypeCode(code))
    }
}

/// Ordered set of named fields with a type id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Structure {
    id: String,
    fields: Vec<(String, Field)>,
}

impl Structure {
    pub fn new(id: impl Into<String>, fields: Vec<(String, Field)>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn builder(id: impl Into<String>) -> StructureBuilder {
        StructureBuilder {
            id: id.into(),
            fields: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fields(&self) -> &[(String, Field)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    /// Nodes in this structure including itself
    pub fn field_count(&self) -> usize {
        1 + self.fields.iter().map(|(_, f)| f.field_count()).sum::<usize>()
    }

    /// Pre-order offset of a dotted field path; the empty path is the root
    pub fn offset_of(&self, path: &str) -> Option<usize> {
        if path.is_empty() {
            return Some(0);
        }
        let mut structure = self;
        let mut offset = 0;
        let mut segments = path.split('.').peekable();
        while let Some(name) = segments.next() {
            let index = structure.index_of(name)?;
            offset += 1 + structure.fields[..index]
                .iter()
                .map(|(_, f)| f.field_count())
                .sum::<usize>();
            let field = &structure.fields[index].1;
            if segments.peek().is_none() {
                return Some(offset);
            }
            match field {
                Field::Structure(sub) => structure = sub,
                _ => return None,
            }
        }
        Some(offset)
    }

    /// Descriptor of a dotted field path
    pub fn field_at(&self, path: &str) -> Option<&Field> {
        let mut structure = self;
        let mut segments = path.split('.').peekable();
        while let Some(name) = segments.next() {
            let field = structure.field(name)?;
            if segments.peek().is_none() {
                return Some(field);
            }
            match field {
                Field::Structure(sub) => structure = sub,
                _ => return None,
            }
        }
        None
    }

    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(STRUCTURE_CODE);
        write_string(buf, &self.id);
        write_size(buf, self.fields.len());
        for (name, field) in &self.fields {
            write_string(buf, name);
            field.serialize(buf);
        }
    }

    fn deserialize_body<B: Buf>(buf: &mut B, depth: usize) -> Result<Structure, CodecError> {
        let id = read_string(buf)?;
        let count = read_size(buf)?;
        let mut fields = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let name = read_string(buf)?;
            let code = get_u8(buf)?;
            fields.push((name, Field::deserialize_nested(code, buf, depth)?));
        }
        Ok(Structure { id, fields })
    }

    /// Normative scalar shape: value, alarm and time stamp
    pub fn nt_scalar(value_type: ScalarType) -> Arc<Structure> {
        let alarm = Structure::builder("alarm_t")
            .scalar("severity", ScalarType::Int)
            .scalar("status", ScalarType::Int)
            .scalar("message", ScalarType::String)
            .build();
        let time_stamp = Structure::builder("time_t")
            .scalar("secondsPastEpoch", ScalarType::Long)
            .scalar("nanoseconds", ScalarType::Int)
            .scalar("userTag", ScalarType::Int)
            .build();
        Structure::builder("epics:nt/NTScalar:1.0")
            .scalar("value", value_type)
            .structure("alarm", alarm)
            .structure("timeStamp", time_stamp)
            .build()
    }
}

/// Incremental construction of a [`Structure`]
pub struct StructureBuilder {
    id: String,
    fields: Vec<(String, Field)>,
}

impl StructureBuilder {
    pub fn scalar(mut self, name: impl Into<String>, scalar_type: ScalarType) -> Self {
        self.fields.push((name.into(), Field::Scalar(scalar_type)));
        self
    }

    pub fn array(mut self, name: impl Into<String>, element_type: ScalarType) -> Self {
        self.fields
            .push((name.into(), Field::ScalarArray(element_type)));
        self
    }

    pub fn structure(mut self, name: impl Into<String>, structure: Arc<Structure>) -> Self {
        self.fields.push((name.into(), Field::Structure(structure)));
        self
    }

    pub fn build(self) -> Arc<Structure> {
        Arc::new(Structure::new(self.id, self.fields))
    }
}

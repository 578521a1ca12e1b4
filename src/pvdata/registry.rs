//! Per-connection type cache
//!
//! Structure descriptors are sent in full once per connection and referred
//! to by a 16-bit id afterwards. Scalar and array descriptors are always
//! written inline. Each direction keeps its own id space.

use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::sync::Arc;

use crate::protocol::{ensure, get_u8, CodecError};

use super::{Field, Structure};

/// No descriptor
pub const NULL_TYPE_CODE: u8 = 0xFF;
/// Reference to a descriptor sent earlier: code followed by its id
pub const ONLY_ID_TYPE_CODE: u8 = 0xFE;
/// New descriptor: code, id, then the full descriptor
pub const FULL_WITH_ID_TYPE_CODE: u8 = 0xFD;

/// Default cap on outgoing cache entries
pub const DEFAULT_REGISTRY_MAX_SIZE: u16 = 0x7FFF;

#[derive(Debug)]
pub struct IntrospectionRegistry {
    outgoing: HashMap<Arc<Structure>, u16>,
    incoming: HashMap<u16, Arc<Structure>>,
    next_id: u16,
    max_size: u16,
}

impl IntrospectionRegistry {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_REGISTRY_MAX_SIZE)
    }

    /// Registry that stops caching outgoing descriptors after `max_size` entries
    pub fn with_max_size(max_size: u16) -> Self {
        Self {
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            next_id: 1,
            max_size,
        }
    }

    /// Adopt the peer's advertised limit if it is smaller than ours
    pub fn limit_max_size(&mut self, peer_max_size: u16) {
        self.max_size = self.max_size.min(peer_max_size);
    }

    /// Number of descriptors sent and received so far
    pub fn len(&self) -> usize {
        self.outgoing.len() + self.incoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.incoming.is_empty()
    }

    /// Forget every cached descriptor in both directions
    pub fn reset(&mut self) {
        self.outgoing.clear();
        self.incoming.clear();
        self.next_id = 1;
    }

    /// Write a descriptor; returns true when a structure got a new id
    pub fn serialize_field<B: BufMut>(&mut self, field: Option<&Field>, buf: &mut B) -> bool {
        match field {
            None => {
                buf.put_u8(NULL_TYPE_CODE);
                false
            }
            Some(Field::Structure(s)) => self.serialize_structure(Some(s), buf),
            Some(inline) => {
                inline.serialize(buf);
                false
            }
        }
    }

    /// Write a structure descriptor; returns true when it got a new id
    pub fn serialize_structure<B: BufMut>(
        &mut self,
        structure: Option<&Arc<Structure>>,
        buf: &mut B,
    ) -> bool {
        let Some(structure) = structure else {
            buf.put_u8(NULL_TYPE_CODE);
            return false;
        };
        if let Some(id) = self.outgoing.get(structure) {
            buf.put_u8(ONLY_ID_TYPE_CODE);
            buf.put_u16(*id);
            return false;
        }
        if self.outgoing.len() >= self.max_size as usize {
            structure.serialize(buf);
            return false;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.outgoing.insert(structure.clone(), id);
        buf.put_u8(FULL_WITH_ID_TYPE_CODE);
        buf.put_u16(id);
        structure.serialize(buf);
        true
    }

    /// Drop an outgoing id whose full descriptor never reached the peer
    pub fn forget(&mut self, structure: &Arc<Structure>) {
        self.outgoing.remove(structure);
    }

    pub fn deserialize_field<B: Buf>(&mut self, buf: &mut B) -> Result<Option<Field>, CodecError> {
        match get_u8(buf)? {
            NULL_TYPE_CODE => Ok(None),
            ONLY_ID_TYPE_CODE => {
                let id = get_id(buf)?;
                self.incoming
                    .get(&id)
                    .map(|s| Some(Field::Structure(s.clone())))
                    .ok_or(CodecError::UnknownTypeId(id))
            }
            FULL_WITH_ID_TYPE_CODE => {
                let id = get_id(buf)?;
                match Field::deserialize(buf)? {
                    Field::Structure(s) => {
                        self.incoming.insert(id, s.clone());
                        Ok(Some(Field::Structure(s)))
                    }
                    other => Err(CodecError::TypeMismatch(format!(
                        "cached descriptor {} is not a structure",
                        other.type_name()
                    ))),
                }
            }
            code => Field::deserialize_with_code(code, buf).map(Some),
        }
    }

    pub fn deserialize_structure<B: Buf>(
        &mut self,
        buf: &mut B,
    ) -> Result<Option<Arc<Structure>>, CodecError> {
        match self.deserialize_field(buf)? {
            None => Ok(None),
            Some(Field::Structure(s)) => Ok(Some(s)),
            Some(other) => Err(CodecError::TypeMismatch(format!(
                "expected structure, found {}",
                other.type_name()
            ))),
        }
    }
}

impl Default for IntrospectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn get_id<B: Buf>(buf: &mut B) -> Result<u16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvdata::ScalarType;
    use bytes::BytesMut;

    #[test]
    fn test_second_send_uses_id() {
        let shape = Structure::nt_scalar(ScalarType::Double);
        let mut sender = IntrospectionRegistry::new();
        let mut receiver = IntrospectionRegistry::new();

        let mut first = BytesMut::new();
        sender.serialize_structure(Some(&shape), &mut first);
        assert_eq!(first[0], FULL_WITH_ID_TYPE_CODE);

        let mut second = BytesMut::new();
        sender.serialize_structure(Some(&shape), &mut second);
        assert_eq!(&second[..], &[ONLY_ID_TYPE_CODE, 0, 1]);

        let a = receiver.deserialize_structure(&mut first.freeze()).unwrap();
        let b = receiver.deserialize_structure(&mut second.freeze()).unwrap();
        assert_eq!(a.as_ref(), Some(&shape));
        assert_eq!(b.as_ref(), Some(&shape));
    }

    #[test]
    fn test_null_and_inline() {
        let mut registry = IntrospectionRegistry::new();
        let mut buf = BytesMut::new();
        registry.serialize_field(None, &mut buf);
        registry.serialize_field(Some(&Field::ScalarArray(ScalarType::Int)), &mut buf);
        assert_eq!(&buf[..], &[NULL_TYPE_CODE, 0x2A]);
        assert!(registry.is_empty());

        let mut rd = buf.freeze();
        assert_eq!(registry.deserialize_field(&mut rd).unwrap(), None);
        assert_eq!(
            registry.deserialize_field(&mut rd).unwrap(),
            Some(Field::ScalarArray(ScalarType::Int))
        );
    }

    #[test]
    fn test_unknown_id_after_reset() {
        let shape = Structure::nt_scalar(ScalarType::Int);
        let mut sender = IntrospectionRegistry::new();
        let mut receiver = IntrospectionRegistry::new();

        let mut buf = BytesMut::new();
        sender.serialize_structure(Some(&shape), &mut buf);
        receiver.deserialize_structure(&mut buf.freeze()).unwrap();
        assert_eq!(receiver.len(), 1);

        receiver.reset();
        assert!(receiver.is_empty());

        let mut again = BytesMut::new();
        sender.serialize_structure(Some(&shape), &mut again);
        assert!(matches!(
            receiver.deserialize_structure(&mut again.freeze()),
            Err(CodecError::UnknownTypeId(1))
        ));

        // the sender starts over too once reset
        sender.reset();
        let mut fresh = BytesMut::new();
        sender.serialize_structure(Some(&shape), &mut fresh);
        assert_eq!(fresh[0], FULL_WITH_ID_TYPE_CODE);
    }

    #[test]
    fn test_forgotten_structure_is_sent_in_full() {
        let shape = Structure::nt_scalar(ScalarType::Double);
        let mut registry = IntrospectionRegistry::new();
        let mut buf = BytesMut::new();
        assert!(registry.serialize_structure(Some(&shape), &mut buf));
        assert!(!registry.serialize_structure(Some(&shape), &mut buf));

        registry.forget(&shape);
        buf.clear();
        assert!(registry.serialize_structure(Some(&shape), &mut buf));
        assert_eq!(buf[0], FULL_WITH_ID_TYPE_CODE);
    }

    #[test]
    fn test_deep_descriptor_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(FULL_WITH_ID_TYPE_CODE);
        buf.put_u16(1);
        buf.extend_from_slice(&super::super::field::tests::nested_descriptor(200_000));

        let mut receiver = IntrospectionRegistry::new();
        assert!(matches!(
            receiver.deserialize_structure(&mut buf.freeze()),
            Err(CodecError::Invalid(_))
        ));
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_full_registry_sends_inline() {
        let mut registry = IntrospectionRegistry::with_max_size(1);
        let a = Structure::nt_scalar(ScalarType::Int);
        let b = Structure::nt_scalar(ScalarType::Float);
        let mut buf = BytesMut::new();
        registry.serialize_structure(Some(&a), &mut buf);
        buf.clear();
        registry.serialize_structure(Some(&b), &mut buf);
        assert_eq!(buf[0], crate::pvdata::STRUCTURE_CODE);

        let mut receiver = IntrospectionRegistry::new();
        let decoded = receiver.deserialize_structure(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, Some(b));
        assert!(receiver.is_empty());
    }
}

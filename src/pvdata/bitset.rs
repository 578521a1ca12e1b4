//! Growable bit set used as a dirty-field mask.
//!
//! Bit `n` refers to the field at pre-order offset `n` of a structure.
//! On the wire the set is a size-prefixed byte string where byte `k` holds
//! bits `8k..8k+7`, least significant bit first, with trailing zero bytes
//! trimmed.

use bytes::{Buf, BufMut};
use std::fmt;

use crate::protocol::{ensure, read_size, write_size, CodecError};

const WORD_BITS: usize = 64;

#[derive(Clone, Default)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bits: usize) -> Self {
        Self {
            words: Vec::with_capacity(bits.div_ceil(WORD_BITS)),
        }
    }

    pub fn set(&mut self, bit: usize) {
        let word = bit / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % WORD_BITS);
    }

    pub fn clear(&mut self, bit: usize) {
        if let Some(w) = self.words.get_mut(bit / WORD_BITS) {
            *w &= !(1 << (bit % WORD_BITS));
        }
    }

    pub fn get(&self, bit: usize) -> bool {
        self.words
            .get(bit / WORD_BITS)
            .map(|w| w & (1 << (bit % WORD_BITS)) != 0)
            .unwrap_or(false)
    }

    pub fn clear_all(&mut self) {
        self.words.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Lowest set bit at or after `from`
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        let mut word_index = from / WORD_BITS;
        if word_index >= self.words.len() {
            return None;
        }
        let mut word = self.words[word_index] & (u64::MAX << (from % WORD_BITS));
        loop {
            if word != 0 {
                return Some(word_index * WORD_BITS + word.trailing_zeros() as usize);
            }
            word_index += 1;
            word = *self.words.get(word_index)?;
        }
    }

    /// Whether any bit in `start..end` is set
    pub fn any_in(&self, start: usize, end: usize) -> bool {
        self.next_set_bit(start).map_or(false, |bit| bit < end)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = self.next_set_bit(0);
        std::iter::from_fn(move || {
            let current = next?;
            next = self.next_set_bit(current + 1);
            Some(current)
        })
    }

    fn byte_len(&self) -> usize {
        match self.words.iter().rposition(|w| *w != 0) {
            Some(last) => {
                let top = WORD_BITS - 1 - self.words[last].leading_zeros() as usize;
                last * 8 + top / 8 + 1
            }
            None => 0,
        }
    }

    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        let len = self.byte_len();
        write_size(buf, len);
        for i in 0..len {
            buf.put_u8((self.words[i / 8] >> ((i % 8) * 8)) as u8);
        }
    }

    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let len = read_size(buf)?;
        ensure(buf, len)?;
        let mut words = vec![0u64; len.div_ceil(8)];
        for i in 0..len {
            words[i / 8] |= (buf.get_u8() as u64) << ((i % 8) * 8);
        }
        Ok(Self { words })
    }
}

impl PartialEq for BitSet {
    fn eq(&self, other: &Self) -> bool {
        let longest = self.words.len().max(other.words.len());
        (0..longest).all(|i| {
            self.words.get(i).copied().unwrap_or(0) == other.words.get(i).copied().unwrap_or(0)
        })
    }
}

impl Eq for BitSet {}

impl FromIterator<usize> for BitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = BitSet::new();
        for bit in iter {
            set.set(bit);
        }
        set
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, bit) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", bit)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_set_get_clear() {
        let mut bits = BitSet::new();
        assert!(bits.is_empty());
        bits.set(3);
        bits.set(70);
        assert!(bits.get(3));
        assert!(bits.get(70));
        assert!(!bits.get(4));
        assert_eq!(bits.cardinality(), 2);

        bits.clear(70);
        assert!(!bits.get(70));
        assert_eq!(bits, BitSet::from_iter([3]));
    }

    #[test]
    fn test_next_set_bit() {
        let bits: BitSet = [1, 5, 64, 130].into_iter().collect();
        assert_eq!(bits.next_set_bit(0), Some(1));
        assert_eq!(bits.next_set_bit(2), Some(5));
        assert_eq!(bits.next_set_bit(6), Some(64));
        assert_eq!(bits.next_set_bit(65), Some(130));
        assert_eq!(bits.next_set_bit(131), None);
        assert_eq!(bits.iter().collect::<Vec<_>>(), vec![1, 5, 64, 130]);
        assert!(bits.any_in(60, 70));
        assert!(!bits.any_in(6, 64));
    }

    #[test]
    fn test_wire_layout() {
        let bits: BitSet = [0, 9].into_iter().collect();
        let mut buf = BytesMut::new();
        bits.serialize(&mut buf);
        assert_eq!(&buf[..], &[2, 0x01, 0x02]);

        let decoded = BitSet::deserialize(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, bits);
    }

    #[test]
    fn test_empty_serializes_to_zero_length() {
        let mut bits = BitSet::new();
        bits.set(100);
        bits.clear(100);
        let mut buf = BytesMut::new();
        bits.serialize(&mut buf);
        assert_eq!(&buf[..], &[0]);
    }

    #[test]
    fn test_display() {
        let bits: BitSet = [2, 4].into_iter().collect();
        assert_eq!(bits.to_string(), "{2, 4}");
    }
}

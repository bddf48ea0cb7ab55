//! Deduplicating interner for short constant strings, and a plain (never
//! deduped) encoder for constant lists, both writing into the constant
//! pool's data stream.
//!
//! Per the data model's interning invariant, a string shorter than
//! [`ConstantInterner::INTERN_THRESHOLD`] gets exactly one data-stream copy
//! no matter how many times it's referenced; longer strings are written
//! fresh every time (the dedup win shrinks as the copy itself grows, while
//! the hash-map lookup cost doesn't).

use rustc_hash::FxHashMap;

use crate::anchor::{AnchorId, AnchorTable, FixupWidth, ReferenceKind, StreamId};
use crate::stream::ByteStream;

/// A value that can appear as an element of a constant list literal.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Nil,
    True,
    Int(i32),
    Float(f64),
    /// A nested string constant; holds the anchor of its own interned copy.
    Str(AnchorId),
}

impl ConstValue {
    fn tag(&self) -> u8 {
        match self {
            ConstValue::Nil => 0,
            ConstValue::True => 1,
            ConstValue::Int(_) => 2,
            ConstValue::Float(_) => 3,
            ConstValue::Str(_) => 4,
        }
    }
}

/// Deduplicates short constant strings and encodes constant lists into a
/// data [`ByteStream`], registering an [`AnchorId`] for each distinct
/// data-stream copy so the code stream can reference it by fixup.
#[derive(Debug, Default)]
pub struct ConstantInterner {
    interned: FxHashMap<Vec<u8>, AnchorId>,
}

impl ConstantInterner {
    /// Strings shorter than this many bytes are deduplicated; at or above it
    /// they're written fresh on every occurrence.
    pub const INTERN_THRESHOLD: usize = 40;

    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, writing a length-prefixed copy into `consts` the first
    /// time a given short string is seen. Returns the anchor backing the
    /// (possibly shared) data-stream copy.
    pub fn intern_string(
        &mut self,
        consts: &mut ByteStream,
        anchors: &mut AnchorTable,
        s: &str,
    ) -> AnchorId {
        let bytes = s.as_bytes();
        let dedup = bytes.len() < Self::INTERN_THRESHOLD;
        if dedup {
            if let Some(&existing) = self.interned.get(bytes) {
                return existing;
            }
        }
        let anchor = Self::write_string(consts, anchors, bytes);
        if dedup {
            self.interned.insert(bytes.to_vec(), anchor);
        }
        anchor
    }

    fn write_string(consts: &mut ByteStream, anchors: &mut AnchorTable, bytes: &[u8]) -> AnchorId {
        let anchor = anchors.create(StreamId::Const);
        anchors.define(anchor, consts.current_offset()).unwrap();
        consts.write_u16(bytes.len() as u16);
        consts.write_bytes(bytes);
        anchors.set_length(anchor, 2 + bytes.len());
        anchor
    }

    /// Encode a constant list as a length-prefixed sequence of dataholders.
    /// Lists are never deduplicated (per §4.8, only strings are).
    pub fn intern_list(
        &mut self,
        consts: &mut ByteStream,
        anchors: &mut AnchorTable,
        elements: &[ConstValue],
    ) -> AnchorId {
        let anchor = anchors.create(StreamId::Const);
        anchors.define(anchor, consts.current_offset()).unwrap();
        let start = consts.current_offset();
        consts.write_u16(elements.len() as u16);
        for elem in elements {
            write_dataholder(consts, anchors, elem);
        }
        anchors.set_length(anchor, consts.current_offset() - start);
        anchor
    }

    pub fn interned_count(&self) -> usize {
        self.interned.len()
    }
}

/// A dataholder is a 1-byte type tag plus a fixed- or variable-size payload,
/// matching the fixed-size tagged value representation lists and property
/// tables use in the image file. A nested string element reserves its
/// 4-byte slot and registers a `ConstAddr` fixup on its own anchor, the same
/// way the code stream would reference it.
fn write_dataholder(stream: &mut ByteStream, anchors: &mut AnchorTable, value: &ConstValue) {
    stream.write_u8(value.tag());
    match value {
        ConstValue::Nil | ConstValue::True => {}
        ConstValue::Int(i) => stream.write_i32(*i),
        ConstValue::Float(f) => stream.write_f64(*f),
        ConstValue::Str(anchor) => {
            let slot = stream.reserve_u32();
            anchors.add_fixup(
                *anchor,
                StreamId::Const,
                slot,
                FixupWidth::Four,
                ReferenceKind::ConstAddr,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_string_interned_once() {
        let mut consts = ByteStream::new();
        let mut anchors = AnchorTable::new();
        let mut interner = ConstantInterner::new();

        let a = interner.intern_string(&mut consts, &mut anchors, "hello");
        let b = interner.intern_string(&mut consts, &mut anchors, "hello");
        assert_eq!(a, b);
        assert_eq!(interner.interned_count(), 1);
        // only one copy written to the data stream
        assert_eq!(consts.len(), 2 + "hello".len());
    }

    #[test]
    fn distinct_strings_get_distinct_anchors() {
        let mut consts = ByteStream::new();
        let mut anchors = AnchorTable::new();
        let mut interner = ConstantInterner::new();
        let a = interner.intern_string(&mut consts, &mut anchors, "foo");
        let b = interner.intern_string(&mut consts, &mut anchors, "bar");
        assert_ne!(a, b);
    }

    #[test]
    fn strings_at_or_above_threshold_are_not_deduped() {
        let long = "x".repeat(ConstantInterner::INTERN_THRESHOLD);
        let mut consts = ByteStream::new();
        let mut anchors = AnchorTable::new();
        let mut interner = ConstantInterner::new();
        let a = interner.intern_string(&mut consts, &mut anchors, &long);
        let b = interner.intern_string(&mut consts, &mut anchors, &long);
        assert_ne!(a, b);
        assert_eq!(interner.interned_count(), 0);
    }

    #[test]
    fn list_emits_length_prefix_and_dataholders() {
        let mut consts = ByteStream::new();
        let mut anchors = AnchorTable::new();
        let mut interner = ConstantInterner::new();
        let anchor = interner.intern_list(
            &mut consts,
            &mut anchors,
            &[ConstValue::Int(1), ConstValue::Nil, ConstValue::True],
        );
        let start = anchors.start_offset(anchor).unwrap();
        assert_eq!(consts.read_u16_at(start), 3);
        // tag + 4-byte int, then two 1-byte tags
        assert_eq!(anchors.length(anchor), Some(2 + (1 + 4) + 1 + 1));
    }

    #[test]
    fn lists_are_never_deduplicated() {
        let mut consts = ByteStream::new();
        let mut anchors = AnchorTable::new();
        let mut interner = ConstantInterner::new();
        let a = interner.intern_list(&mut consts, &mut anchors, &[ConstValue::Nil]);
        let b = interner.intern_list(&mut consts, &mut anchors, &[ConstValue::Nil]);
        assert_ne!(a, b);
    }

    #[test]
    fn nested_string_element_registers_a_resolvable_fixup() {
        let mut consts = ByteStream::new();
        let mut anchors = AnchorTable::new();
        let mut interner = ConstantInterner::new();
        let inner = interner.intern_string(&mut consts, &mut anchors, "nested");
        let list_anchor =
            interner.intern_list(&mut consts, &mut anchors, &[ConstValue::Str(inner)]);
        assert_eq!(anchors.fixup_count(inner), 1);

        let mut objects = ByteStream::new();
        anchors
            .resolve(&mut crate::anchor::Streams {
                code: &mut ByteStream::new(),
                constants: &mut consts,
                objects: &mut objects,
            })
            .unwrap();

        let list_start = anchors.start_offset(list_anchor).unwrap();
        // length prefix(2) + tag(1) precede the patched 4-byte slot
        let slot = list_start + 2 + 1;
        let inner_start = anchors.start_offset(inner).unwrap();
        assert_eq!(consts.read_u32_at(slot), inner_start as u32);
    }
}

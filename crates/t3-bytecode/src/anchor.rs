//! Anchors and fixups: the forward-reference machinery that lets function A
//! call not-yet-emitted function B (and vice versa) without either one
//! knowing the other's final address while it's being generated.
//!
//! An [`Anchor`] owns a region of some stream that isn't known at the moment
//! code referencing it is emitted -- a function body, a constant string, an
//! object's static data. Every reference to that region records a [`Fixup`]
//! on the anchor's inbound list instead of writing the real address
//! directly. Once every code body has been emitted and every anchor has a
//! final stream offset, [`AnchorTable::resolve`] walks the fixup lists and
//! patches the placeholders.

use rustc_hash::FxHashMap;
use std::fmt;

use crate::stream::ByteStream;

/// Which of the code generator's streams a stream offset refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    Code,
    Const,
    Object,
}

/// What kind of value a fixup ultimately carries. `CodeAddr`, `ConstAddr`,
/// and `ObjId` are resolved by [`AnchorTable`] once all anchors have a final
/// stream offset. `PropId`, `EnumId`, and `BifId` name a namespace the code
/// generator assigns *eagerly* during its registration pass (this is a
/// single-translation-unit compiler with no linker, so there is nothing to
/// defer); they are included here to keep the reference-kind taxonomy
/// complete, but this crate never places one in an anchor's inbound list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    CodeAddr,
    ConstAddr,
    ObjId,
    PropId,
    EnumId,
    BifId,
}

/// Width, in bytes, of the value a fixup patches in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupWidth {
    Two,
    Four,
}

/// A pending back-patch: "at `target_stream[target_offset]`, once `anchor`
/// has a final address, write it there as a little-endian value of
/// `width`."
#[derive(Debug, Clone)]
pub struct Fixup {
    pub target_stream: StreamId,
    pub target_offset: usize,
    pub width: FixupWidth,
    pub kind: ReferenceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorId(u32);

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "anchor{}", self.0)
    }
}

#[derive(Debug)]
struct AnchorEntry {
    stream: StreamId,
    start_offset: Option<usize>,
    length: Option<usize>,
    fixups: Vec<Fixup>,
}

/// Errors produced while registering or resolving anchors.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AnchorError {
    #[error("unresolved reference: anchor {0} was never defined")]
    UnresolvedReference(AnchorId),
    #[error("anchor {0} defined more than once")]
    AlreadyDefined(AnchorId),
}

/// Owns every [`Anchor`] created during one compilation unit's code
/// generation: functions, objects, anonymous functions, constant
/// strings/lists, and exception tables each get exactly one.
#[derive(Debug, Default)]
pub struct AnchorTable {
    entries: Vec<AnchorEntry>,
}

impl AnchorTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a new, as-yet-undefined anchor living in `stream`.
    pub fn create(&mut self, stream: StreamId) -> AnchorId {
        let id = AnchorId(self.entries.len() as u32);
        self.entries.push(AnchorEntry {
            stream,
            start_offset: None,
            length: None,
            fixups: Vec::new(),
        });
        id
    }

    /// Mark `anchor` as beginning at `offset` in its stream. Called once
    /// emission of the region the anchor tracks actually starts.
    pub fn define(&mut self, anchor: AnchorId, offset: usize) -> Result<(), AnchorError> {
        let entry = &mut self.entries[anchor.0 as usize];
        if entry.start_offset.is_some() {
            return Err(AnchorError::AlreadyDefined(anchor));
        }
        entry.start_offset = Some(offset);
        Ok(())
    }

    /// Record the anchor's final length once its region has been fully
    /// emitted (used by the image writer layout pass, not by fixup
    /// resolution itself).
    pub fn set_length(&mut self, anchor: AnchorId, length: usize) {
        self.entries[anchor.0 as usize].length = Some(length);
    }

    pub fn start_offset(&self, anchor: AnchorId) -> Option<usize> {
        self.entries[anchor.0 as usize].start_offset
    }

    pub fn length(&self, anchor: AnchorId) -> Option<usize> {
        self.entries[anchor.0 as usize].length
    }

    pub fn stream_of(&self, anchor: AnchorId) -> StreamId {
        self.entries[anchor.0 as usize].stream
    }

    /// Record an inbound fixup: a placeholder was just written at
    /// `target_stream[target_offset]` that should eventually hold `anchor`'s
    /// final address.
    pub fn add_fixup(
        &mut self,
        anchor: AnchorId,
        target_stream: StreamId,
        target_offset: usize,
        width: FixupWidth,
        kind: ReferenceKind,
    ) {
        self.entries[anchor.0 as usize].fixups.push(Fixup {
            target_stream,
            target_offset,
            width,
            kind,
        });
    }

    pub fn fixup_count(&self, anchor: AnchorId) -> usize {
        self.entries[anchor.0 as usize].fixups.len()
    }

    /// Walk every anchor's inbound fixup list and patch the resolved
    /// address into the corresponding stream. `streams` maps a [`StreamId`]
    /// to the live [`ByteStream`] it names.
    pub fn resolve(&self, streams: &mut Streams<'_>) -> Result<(), AnchorError> {
        for (idx, entry) in self.entries.iter().enumerate() {
            let Some(final_addr) = entry.start_offset else {
                if entry.fixups.is_empty() {
                    // Anchors created but never referenced (e.g. an unused
                    // helper) don't need a definition.
                    continue;
                }
                return Err(AnchorError::UnresolvedReference(AnchorId(idx as u32)));
            };
            for fixup in &entry.fixups {
                let stream = streams.get_mut(fixup.target_stream);
                match fixup.width {
                    FixupWidth::Two => {
                        stream.patch_u16_at(fixup.target_offset, final_addr as u16);
                    }
                    FixupWidth::Four => {
                        stream.patch_u32_at(fixup.target_offset, final_addr as u32);
                    }
                }
            }
        }
        Ok(())
    }

    /// Same closure check [`Self::resolve`] performs, without touching any
    /// stream -- lets a verifier confirm every fixup would resolve cleanly
    /// before (or after) the streams are actually patched.
    pub fn check_closure(&self) -> Result<(), AnchorError> {
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.start_offset.is_none() && !entry.fixups.is_empty() {
                return Err(AnchorError::UnresolvedReference(AnchorId(idx as u32)));
            }
        }
        Ok(())
    }
}

/// The three streams a fixup's `target_stream` can name, gathered for a
/// resolution pass. Kept as borrowed handles rather than owned so
/// [`AnchorTable::resolve`] can be called without taking ownership of the
/// generator's streams.
pub struct Streams<'a> {
    pub code: &'a mut ByteStream,
    pub constants: &'a mut ByteStream,
    pub objects: &'a mut ByteStream,
}

impl<'a> Streams<'a> {
    fn get_mut(&mut self, id: StreamId) -> &mut ByteStream {
        match id {
            StreamId::Code => self.code,
            StreamId::Const => self.constants,
            StreamId::Object => self.objects,
        }
    }
}

/// A convenience map from name to [`AnchorId`], used by the code generator's
/// registration pass to pre-assign anchors to every top-level function and
/// object before walking any body.
#[derive(Debug, Default)]
pub struct AnchorRegistry {
    by_name: FxHashMap<String, AnchorId>,
}

impl AnchorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, anchor: AnchorId) {
        self.by_name.insert(name.into(), anchor);
    }

    pub fn get(&self, name: &str) -> Option<AnchorId> {
        self.by_name.get(name).copied()
    }
}

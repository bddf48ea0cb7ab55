//! Forward/backward branch targets within a single code stream.
//!
//! A [`Label`] starts life *pending*: it doesn't yet know where it will be
//! defined, but branches can already reference it. Each such reference
//! records a *pending site* -- the stream offset of the two-byte
//! displacement that will need patching. Once [`Label::define`] is called
//! the label becomes *defined* and every pending site is immediately
//! patched with `target - (site + 2)`, matching the VM's definition of a
//! branch displacement as relative to the byte immediately following the
//! 2-byte operand.

use crate::stream::ByteStream;

#[derive(Debug, Clone, Copy)]
struct PendingSite {
    offset: usize,
}

#[derive(Debug, Clone)]
enum LabelState {
    Pending(Vec<PendingSite>),
    Defined(usize),
}

/// A branch target inside one code body's [`ByteStream`].
///
/// Labels are scoped to a single code body: the code generator creates one
/// per loop/branch target and discards the set at method boundaries (per the
/// "labels live for one code body" lifecycle rule).
#[derive(Debug, Clone)]
pub struct Label {
    state: LabelState,
}

impl Default for Label {
    fn default() -> Self {
        Self::new()
    }
}

impl Label {
    pub fn new() -> Self {
        Label {
            state: LabelState::Pending(Vec::new()),
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self.state, LabelState::Defined(_))
    }

    pub fn address(&self) -> Option<usize> {
        match self.state {
            LabelState::Defined(addr) => Some(addr),
            LabelState::Pending(_) => None,
        }
    }

    /// Emit a 2-byte placeholder displacement at the stream's current
    /// offset and register it as a pending site if the label isn't defined
    /// yet; if it is already defined, the displacement is computed and
    /// written immediately (a backward branch).
    pub fn emit_reference(&mut self, stream: &mut ByteStream) {
        let site = stream.current_offset();
        stream.write_i16(0);
        self.register_reference_at(stream, site);
    }

    /// Same as [`Self::emit_reference`], but the 2-byte placeholder at
    /// `site` has already been written by the caller -- used when the jump
    /// opcode went through the peephole optimizer, which may have placed it
    /// somewhere other than the stream's offset at the time the caller
    /// asked for the reference (fusion can erase a preceding instruction
    /// and rewrite in its place).
    pub fn register_reference_at(&mut self, stream: &mut ByteStream, site: usize) {
        match &mut self.state {
            LabelState::Pending(sites) => sites.push(PendingSite { offset: site }),
            LabelState::Defined(target) => {
                let disp = Self::displacement(*target, site);
                stream.patch_i16_at(site, disp);
            }
        }
    }

    /// Define the label at the stream's current offset, patching every
    /// pending site registered so far. Calling this twice on the same label
    /// is a programmer error (a label is defined exactly once).
    pub fn define(&mut self, stream: &mut ByteStream) {
        assert!(!self.is_defined(), "label defined more than once");
        let target = stream.current_offset();
        if let LabelState::Pending(sites) = &self.state {
            for site in sites {
                let disp = Self::displacement(target, site.offset);
                stream.patch_i16_at(site.offset, disp);
            }
        }
        self.state = LabelState::Defined(target);
    }

    fn displacement(target: usize, site: usize) -> i16 {
        (target as isize - (site as isize + 2)) as i16
    }
}

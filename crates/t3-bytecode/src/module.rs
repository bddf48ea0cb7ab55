//! In-memory representation of a compiled translation unit: the finalized
//! code/constant/object streams plus the tables the image writer needs to
//! frame them into blocks (§4.9/§6). Building one of these is the code
//! generator's job; everything here is just data plus the fixed-size
//! header/table encodings the real VM expects to find in the image file.

use thiserror::Error;

use crate::anchor::{AnchorId, AnchorTable};
use crate::stream::ByteStream;

/// `u8 argc | (varargs ? 0x80 : 0)`, `u8 optional_argc`, `u16 local_count`,
/// `u16 max_stack`, `u16 exc_table_rel_offset`, `u16 debug_rel_offset` --
/// the fixed 10-byte method prolog described in §6.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodHeader {
    pub argc: u8,
    pub varargs: bool,
    pub optional_argc: u8,
    pub local_count: u16,
    pub max_stack: u16,
    pub exc_table_rel_offset: u16,
    pub debug_rel_offset: u16,
}

/// Committed on-disk size of a [`MethodHeader`]; any future growth of the
/// target VM's header is zero-padded out to this size rather than shifting
/// the fields that follow it.
pub const METHOD_HEADER_SIZE: usize = 10;

impl MethodHeader {
    pub fn encode(&self, out: &mut ByteStream) {
        let argc_byte = self.argc | if self.varargs { 0x80 } else { 0 };
        out.write_u8(argc_byte);
        out.write_u8(self.optional_argc);
        out.write_u16(self.local_count);
        out.write_u16(self.max_stack);
        out.write_u16(self.exc_table_rel_offset);
        out.write_u16(self.debug_rel_offset);
    }

    pub fn decode(bytes: &[u8]) -> Result<MethodHeader, ModuleError> {
        if bytes.len() < METHOD_HEADER_SIZE {
            return Err(ModuleError::Truncated("method header"));
        }
        let argc_byte = bytes[0];
        Ok(MethodHeader {
            argc: argc_byte & 0x7f,
            varargs: argc_byte & 0x80 != 0,
            optional_argc: bytes[1],
            local_count: u16::from_le_bytes([bytes[2], bytes[3]]),
            max_stack: u16::from_le_bytes([bytes[4], bytes[5]]),
            exc_table_rel_offset: u16::from_le_bytes([bytes[6], bytes[7]]),
            debug_rel_offset: u16::from_le_bytes([bytes[8], bytes[9]]),
        })
    }
}

/// `(start_rel, end_rel, obj_id, catch_rel)`, all relative to the owning
/// method's header (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_rel: u16,
    pub end_rel: u16,
    pub exc_obj_id: u32,
    pub catch_rel: u16,
}

impl ExceptionTableEntry {
    pub fn encode(&self, out: &mut ByteStream) {
        out.write_u16(self.start_rel);
        out.write_u16(self.end_rel);
        out.write_u32(self.exc_obj_id);
        out.write_u16(self.catch_rel);
    }

    pub fn decode(bytes: &[u8]) -> Result<ExceptionTableEntry, ModuleError> {
        if bytes.len() < 10 {
            return Err(ModuleError::Truncated("exception table entry"));
        }
        Ok(ExceptionTableEntry {
            start_rel: u16::from_le_bytes([bytes[0], bytes[1]]),
            end_rel: u16::from_le_bytes([bytes[2], bytes[3]]),
            exc_obj_id: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            catch_rel: u16::from_le_bytes([bytes[8], bytes[9]]),
        })
    }
}

/// A compiled function or method: its header/exception table plus the
/// anchor locating its prolog in the code stream.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub anchor: AnchorId,
    pub header: MethodHeader,
    pub exception_table: Vec<ExceptionTableEntry>,
}

/// A static object instance's data, living in the object stream.
#[derive(Debug, Clone)]
pub struct ObjectDef {
    pub name: String,
    pub metaclass: String,
    pub anchor: AnchorId,
    pub large_objects: bool,
    pub transient: bool,
}

/// An `FNSD`/`MCLD`-style dependency entry: a base name plus a six-digit
/// version. §6 requires that merging two entries for the same base name
/// keeps the higher version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEntry {
    pub name: String,
    pub version: u32,
}

impl DependencyEntry {
    /// Parse `"name/vvvvvv"` into its base name and numeric version.
    pub fn parse(encoded: &str) -> Option<DependencyEntry> {
        let (name, version) = encoded.rsplit_once('/')?;
        if version.len() != 6 || !version.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(DependencyEntry {
            name: name.to_string(),
            version: version.parse().ok()?,
        })
    }

    pub fn formatted(&self) -> String {
        format!("{}/{:06}", self.name, self.version)
    }
}

/// Merge `entry` into `table`, keeping the higher version when the base
/// name already exists.
pub fn merge_dependency(table: &mut Vec<DependencyEntry>, entry: DependencyEntry) {
    if let Some(existing) = table.iter_mut().find(|e| e.name == entry.name) {
        if entry.version > existing.version {
            existing.version = entry.version;
        }
    } else {
        table.push(entry);
    }
}

/// A metaclass dependency carries, in addition to its versioned name, the
/// ordered list of property IDs the compiled unit references on instances
/// of that metaclass (§4.9 MCLD).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaclassDep {
    pub entry: DependencyEntry,
    pub prop_ids: Vec<u16>,
}

/// The finalized output of one translation unit's code generation: three
/// byte streams plus the tables needed to frame them into an image file.
#[derive(Debug)]
pub struct Module {
    pub code: ByteStream,
    pub constants: ByteStream,
    pub objects_data: ByteStream,
    pub anchors: AnchorTable,
    pub functions: Vec<Function>,
    pub objects: Vec<ObjectDef>,
    pub function_sets: Vec<DependencyEntry>,
    pub metaclasses: Vec<MetaclassDep>,
    /// Anchor of the function run first when the image loads.
    pub entry_point: Option<AnchorId>,
}

impl Module {
    pub fn new() -> Self {
        Module {
            code: ByteStream::new(),
            constants: ByteStream::new(),
            objects_data: ByteStream::new(),
            anchors: AnchorTable::new(),
            functions: Vec::new(),
            objects: Vec::new(),
            function_sets: Vec::new(),
            metaclasses: Vec::new(),
            entry_point: None,
        }
    }

    pub fn find_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModuleError {
    #[error("truncated {0}")]
    Truncated(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_header_round_trips() {
        let header = MethodHeader {
            argc: 3,
            varargs: true,
            optional_argc: 1,
            local_count: 5,
            max_stack: 12,
            exc_table_rel_offset: 20,
            debug_rel_offset: 40,
        };
        let mut out = ByteStream::new();
        header.encode(&mut out);
        assert_eq!(out.len(), METHOD_HEADER_SIZE);
        let decoded = MethodHeader::decode(out.as_bytes()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn varargs_flag_lives_in_high_bit_of_argc_byte() {
        let header = MethodHeader {
            argc: 2,
            varargs: true,
            ..Default::default()
        };
        let mut out = ByteStream::new();
        header.encode(&mut out);
        assert_eq!(out.get_u8_at(0), 0x82);
    }

    #[test]
    fn exception_table_entry_round_trips() {
        let entry = ExceptionTableEntry {
            start_rel: 4,
            end_rel: 20,
            exc_obj_id: 7,
            catch_rel: 22,
        };
        let mut out = ByteStream::new();
        entry.encode(&mut out);
        let decoded = ExceptionTableEntry::decode(out.as_bytes()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn dependency_entry_parses_versioned_name() {
        let dep = DependencyEntry::parse("tads-gen/000003").unwrap();
        assert_eq!(dep.name, "tads-gen");
        assert_eq!(dep.version, 3);
        assert_eq!(dep.formatted(), "tads-gen/000003");
    }

    #[test]
    fn dependency_merge_keeps_higher_version() {
        let mut table = vec![DependencyEntry {
            name: "tads-gen".into(),
            version: 1,
        }];
        merge_dependency(
            &mut table,
            DependencyEntry {
                name: "tads-gen".into(),
                version: 3,
            },
        );
        merge_dependency(
            &mut table,
            DependencyEntry {
                name: "tads-gen".into(),
                version: 2,
            },
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].version, 3);
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let err = MethodHeader::decode(&[0, 0, 0]).unwrap_err();
        assert_eq!(err, ModuleError::Truncated("method header"));
    }
}

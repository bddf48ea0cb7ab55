//! Block-framed binary image-file writer (§4.9, §6).
//!
//! Every block is `4-byte tag + u32 size + u16 flags + size bytes of
//! payload`. Blocks cannot nest: starting a new block implicitly ends
//! whichever one was open. The size field is always written as a zero
//! placeholder when the block opens and patched in once the block's
//! payload is fully written, by seeking back to the size field and seeking
//! forward again afterward -- the same reserve-then-patch idiom
//! [`crate::stream::ByteStream`] uses in memory, just against a real `Seek`
//! sink.

use std::io::{self, Seek, SeekFrom, Write};

use rustc_hash::FxHashMap;
use thiserror::Error;

/// `page_size`/`tool_id`/`xor_mask` are the only externally-visible knobs
/// the image writer leaves as parameters; everything else about the file
/// layout is fixed by §6.
#[derive(Debug, Clone, Copy)]
pub struct ImageOptions {
    pub page_size: u32,
    pub tool_id: [u8; 4],
    pub xor_mask: u8,
}

impl Default for ImageOptions {
    fn default() -> Self {
        ImageOptions {
            page_size: 4096,
            tool_id: *b"T3CG",
            xor_mask: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("block payload of {0} bytes exceeds the 32-bit size field")]
    BlockTooLarge(usize),
    #[error("a block was left open when the writer was finished")]
    UnterminatedBlock,
    #[error("timestamp must be exactly 24 ASCII bytes, got {0}")]
    BadTimestampLength(usize),
}

const SIGNATURE: &[u8] = b"T3-image\r\n\x1a";
const HEADER_RESERVED: usize = 28;
const TOOL_ID_LEN: usize = 4;
const TIMESTAMP_LEN: usize = 24;

pub const TAG_ENTP: [u8; 4] = *b"ENTP";
pub const TAG_FNSD: [u8; 4] = *b"FNSD";
pub const TAG_MCLD: [u8; 4] = *b"MCLD";
pub const TAG_CPDF: [u8; 4] = *b"CPDF";
pub const TAG_CPPG: [u8; 4] = *b"CPPG";
pub const TAG_SYMD: [u8; 4] = *b"SYMD";
pub const TAG_OBJS: [u8; 4] = *b"OBJS";
pub const TAG_SRCF: [u8; 4] = *b"SRCF";
pub const TAG_GSYM: [u8; 4] = *b"GSYM";
pub const TAG_MHLS: [u8; 4] = *b"MHLS";
pub const TAG_SINI: [u8; 4] = *b"SINI";
pub const TAG_MACR: [u8; 4] = *b"MACR";
pub const TAG_EOF: [u8; 4] = *b"EOF ";

const MANDATORY: u16 = 0x0001;

struct OpenBlock {
    /// Position of the 4-byte size field, for the end-of-block patch.
    size_field_pos: u64,
    /// Position where the payload begins, so the size can be computed as
    /// `current_pos - payload_start`.
    payload_start: u64,
}

/// Writes the block-structured T3 image format described in §4.9/§6.
///
/// Generic over any `Write + Seek` sink so tests can target an in-memory
/// `Cursor<Vec<u8>>` as cheaply as a real file.
pub struct ImageWriter<W: Write + Seek> {
    out: W,
    open: Option<OpenBlock>,
    options: ImageOptions,
    /// Seek position of the pending `MCLD` item's property-list count field,
    /// while one is open; `None` otherwise. Property lists don't nest, so a
    /// single slot is enough.
    meta_propcnt_pos: Option<u64>,
    meta_prop_cnt: u16,
}

impl<W: Write + Seek> ImageWriter<W> {
    pub fn new(out: W, options: ImageOptions) -> Self {
        ImageWriter {
            out,
            open: None,
            options,
            meta_propcnt_pos: None,
            meta_prop_cnt: 0,
        }
    }

    pub fn options(&self) -> &ImageOptions {
        &self.options
    }

    fn pos(&mut self) -> Result<u64, ImageError> {
        Ok(self.out.stream_position()?)
    }

    /// Write the fixed file header. Must be called exactly once, before any
    /// block.
    pub fn prepare(&mut self, version: u16, timestamp: &str) -> Result<(), ImageError> {
        if timestamp.len() != TIMESTAMP_LEN {
            return Err(ImageError::BadTimestampLength(timestamp.len()));
        }
        self.out.write_all(SIGNATURE)?;
        self.out.write_all(&version.to_le_bytes())?;
        self.out.write_all(&[0u8; HEADER_RESERVED])?;
        self.out.write_all(&self.options.tool_id)?;
        debug_assert_eq!(self.options.tool_id.len(), TOOL_ID_LEN);
        self.out.write_all(timestamp.as_bytes())?;
        Ok(())
    }

    /// Open a new block, implicitly closing whichever block was open.
    pub fn begin_block(&mut self, tag: [u8; 4], mandatory: bool) -> Result<(), ImageError> {
        self.end_block()?;
        self.out.write_all(&tag)?;
        let size_field_pos = self.pos()?;
        self.out.write_all(&0u32.to_le_bytes())?;
        let flags: u16 = if mandatory { MANDATORY } else { 0 };
        self.out.write_all(&flags.to_le_bytes())?;
        let payload_start = self.pos()?;
        self.open = Some(OpenBlock {
            size_field_pos,
            payload_start,
        });
        Ok(())
    }

    /// End the current block (a no-op if none is open), patching its size
    /// field by seeking back.
    pub fn end_block(&mut self) -> Result<(), ImageError> {
        let Some(block) = self.open.take() else {
            return Ok(());
        };
        let end_pos = self.pos()?;
        let size = end_pos - block.payload_start;
        let size: u32 = size
            .try_into()
            .map_err(|_| ImageError::BlockTooLarge(size as usize))?;
        self.out.seek(SeekFrom::Start(block.size_field_pos))?;
        self.out.write_all(&size.to_le_bytes())?;
        self.out.seek(SeekFrom::Start(end_pos))?;
        Ok(())
    }

    /// Write raw bytes into the currently open block, chunked to at most
    /// 65535 bytes per `write_all` call to accommodate 16-bit size counters
    /// on legacy platforms that might re-chunk this stream downstream.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ImageError> {
        for chunk in bytes.chunks(0xFFFF) {
            self.out.write_all(chunk)?;
        }
        Ok(())
    }

    fn write_u8(&mut self, v: u8) -> Result<(), ImageError> {
        self.out.write_all(&[v])?;
        Ok(())
    }

    fn write_u16(&mut self, v: u16) -> Result<(), ImageError> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32(&mut self, v: u32) -> Result<(), ImageError> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    /// Complete `ENTP` block.
    #[allow(clippy::too_many_arguments)]
    pub fn write_entrypt(
        &mut self,
        entry_ofs: u32,
        method_header_size: u16,
        exc_entry_size: u16,
        line_entry_size: u16,
        dbg_hdr_size: u16,
        dbg_lclsym_hdr_size: u16,
        dbg_frame_hdr_size: u16,
        dbg_vsn_id: u16,
    ) -> Result<(), ImageError> {
        self.begin_block(TAG_ENTP, true)?;
        self.write_u32(entry_ofs)?;
        self.write_u16(method_header_size)?;
        self.write_u16(exc_entry_size)?;
        self.write_u16(line_entry_size)?;
        self.write_u16(dbg_hdr_size)?;
        self.write_u16(dbg_lclsym_hdr_size)?;
        self.write_u16(dbg_frame_hdr_size)?;
        self.write_u16(dbg_vsn_id)?;
        Ok(())
    }

    /// Complete dependency block (`FNSD` or `MCLD` without property lists).
    fn write_dep_block(&mut self, tag: [u8; 4], names: &[String]) -> Result<(), ImageError> {
        self.begin_dep_block(tag, names.len())?;
        for name in names {
            self.write_dep_block_item(name)?;
        }
        Ok(())
    }

    pub fn write_func_dep(&mut self, funcset_names: &[String]) -> Result<(), ImageError> {
        self.write_dep_block(TAG_FNSD, funcset_names)
    }

    fn begin_dep_block(&mut self, tag: [u8; 4], count: usize) -> Result<(), ImageError> {
        self.begin_block(tag, true)?;
        self.write_u16(count as u16)?;
        Ok(())
    }

    fn write_dep_block_item(&mut self, name: &str) -> Result<(), ImageError> {
        let bytes = name.as_bytes();
        self.write_u8(bytes.len() as u8)?;
        self.write_bytes(bytes)?;
        Ok(())
    }

    pub fn begin_func_dep(&mut self, count: usize) -> Result<(), ImageError> {
        self.begin_dep_block(TAG_FNSD, count)
    }

    pub fn write_func_dep_item(&mut self, name: &str) -> Result<(), ImageError> {
        self.write_dep_block_item(name)
    }

    /// Complete `MCLD` block: each metaclass entry carries its versioned
    /// name followed by the property-id vector the compiled unit uses on
    /// it.
    pub fn write_meta_dep(&mut self, entries: &[(String, Vec<u16>)]) -> Result<(), ImageError> {
        self.begin_meta_dep(entries.len())?;
        for (name, props) in entries {
            self.write_meta_dep_item(name)?;
            for &prop in props {
                self.write_meta_item_prop(prop)?;
            }
            self.end_meta_prop_list()?;
        }
        self.end_meta_dep()
    }

    pub fn begin_meta_dep(&mut self, count: usize) -> Result<(), ImageError> {
        self.begin_block(TAG_MCLD, true)?;
        self.write_u16(count as u16)?;
        Ok(())
    }

    pub fn write_meta_dep_item(&mut self, name: &str) -> Result<(), ImageError> {
        self.write_dep_block_item(name)?;
        // reserve space for the property-list count, fixed up in
        // end_meta_prop_list(); there's no separate tracking struct because
        // property lists don't nest and the writer only ever has one open.
        let pos = self.pos()?;
        self.write_u16(0)?;
        self.meta_propcnt_pos = Some(pos);
        self.meta_prop_cnt = 0;
        Ok(())
    }

    pub fn write_meta_item_prop(&mut self, prop_id: u16) -> Result<(), ImageError> {
        self.write_u16(prop_id)?;
        self.meta_prop_cnt += 1;
        Ok(())
    }

    pub fn end_meta_prop_list(&mut self) -> Result<(), ImageError> {
        if let Some(pos) = self.meta_propcnt_pos.take() {
            let after = self.pos()?;
            self.out.seek(SeekFrom::Start(pos))?;
            self.write_u16(self.meta_prop_cnt)?;
            self.out.seek(SeekFrom::Start(after))?;
        }
        Ok(())
    }

    pub fn end_meta_dep(&mut self) -> Result<(), ImageError> {
        self.end_block()
    }

    /// Complete `OBJS` block: every object's already-resolved static data,
    /// grouped by metaclass (§4.9 item 6). Each group's flags are the union
    /// of `large_objects`/`transient` across its members.
    pub fn write_objs(&mut self, groups: &[ObjGroup<'_>]) -> Result<(), ImageError> {
        self.begin_objs(groups.len())?;
        for group in groups {
            self.write_obj_group(group.metaclass, group.flags, &group.objects)?;
        }
        self.end_objs()
    }

    pub fn begin_objs(&mut self, group_count: usize) -> Result<(), ImageError> {
        self.begin_block(TAG_OBJS, false)?;
        self.write_u16(group_count as u16)?;
        Ok(())
    }

    /// Write one complete metaclass group: its name, flags, member count,
    /// then each member's length-prefixed static data in turn.
    pub fn write_obj_group(
        &mut self,
        metaclass: &str,
        flags: u16,
        objects: &[&[u8]],
    ) -> Result<(), ImageError> {
        self.write_dep_block_item(metaclass)?;
        self.write_u16(flags)?;
        self.write_u16(objects.len() as u16)?;
        for data in objects {
            self.write_obj_item(data)?;
        }
        Ok(())
    }

    pub fn write_obj_item(&mut self, data: &[u8]) -> Result<(), ImageError> {
        self.write_u32(data.len() as u32)?;
        self.write_bytes(data)
    }

    pub fn end_objs(&mut self) -> Result<(), ImageError> {
        self.end_block()
    }

    /// `CPDF` pool definition block. Returns the file offset at which the
    /// block began, for use with [`Self::fix_pool_def`] when the page count
    /// isn't known until after the pages themselves are written.
    pub fn write_pool_def(
        &mut self,
        pool_id: u16,
        page_count: u32,
        page_size: u32,
        mandatory: bool,
    ) -> Result<u64, ImageError> {
        let def_seek_ofs = self.pos()?;
        self.begin_block(TAG_CPDF, mandatory)?;
        self.write_u16(pool_id)?;
        self.write_u32(page_count)?;
        self.write_u32(page_size)?;
        self.end_block()?;
        Ok(def_seek_ofs)
    }

    /// Seek back to a previously written `CPDF` block and patch in the
    /// final page count, leaving the write position where it was.
    pub fn fix_pool_def(&mut self, def_seek_ofs: u64, page_count: u32) -> Result<(), ImageError> {
        let resume = self.pos()?;
        // tag(4) + size(4) + flags(2) + pool_id(2) = offset of page_count
        let page_count_ofs = def_seek_ofs + 12;
        self.out.seek(SeekFrom::Start(page_count_ofs))?;
        self.write_u32(page_count)?;
        self.out.seek(SeekFrom::Start(resume))?;
        Ok(())
    }

    /// Write one complete `CPPG` page: `u16 pool_id`, `u32 page_index`,
    /// `u8 xor_mask`, then the page bytes XORed with `xor_mask`. `xor_mask
    /// == 0` is a no-op fast path (no XOR pass over the buffer).
    pub fn write_pool_page(
        &mut self,
        pool_id: u16,
        page_index: u32,
        page_data: &[u8],
        mandatory: bool,
        xor_mask: u8,
    ) -> Result<(), ImageError> {
        self.begin_pool_page(pool_id, page_index, mandatory, xor_mask)?;
        self.write_pool_page_bytes(page_data, xor_mask)?;
        self.end_pool_page()
    }

    pub fn begin_pool_page(
        &mut self,
        pool_id: u16,
        page_index: u32,
        mandatory: bool,
        xor_mask: u8,
    ) -> Result<(), ImageError> {
        self.begin_block(TAG_CPPG, mandatory)?;
        self.write_u16(pool_id)?;
        self.write_u32(page_index)?;
        self.write_u8(xor_mask)?;
        Ok(())
    }

    pub fn write_pool_page_bytes(&mut self, buf: &[u8], xor_mask: u8) -> Result<(), ImageError> {
        if xor_mask == 0 {
            self.write_bytes(buf)
        } else {
            let masked: Vec<u8> = buf.iter().map(|b| b ^ xor_mask).collect();
            self.write_bytes(&masked)
        }
    }

    pub fn end_pool_page(&mut self) -> Result<(), ImageError> {
        self.end_block()
    }

    /// Finish the file: close any open block and write the mandatory, empty
    /// `EOF ` block.
    pub fn finish(mut self) -> Result<W, ImageError> {
        self.end_block()?;
        self.begin_block(TAG_EOF, true)?;
        self.end_block()?;
        Ok(self.out)
    }
}

/// Pool id a stream's bytes are framed under. §4.9 item 5 limits `CPDF`/
/// `CPPG` pool framing to the code and constant pools; object static data
/// has its own block type (`OBJS`) entirely, not a third pool.
const POOL_CODE: u16 = 1;
const POOL_CONST: u16 = 2;

pub const OBJ_FLAG_LARGE: u16 = 0x0001;
pub const OBJ_FLAG_TRANSIENT: u16 = 0x0002;

/// One metaclass's worth of object static data, ready for [`ImageWriter::write_objs`].
pub struct ObjGroup<'a> {
    pub metaclass: &'a str,
    pub flags: u16,
    pub objects: Vec<&'a [u8]>,
}

/// Group `module.objects` by metaclass, preserving the order each metaclass
/// name was first seen, and resolve each object's anchor into the slice of
/// `module.objects_data` it actually owns.
fn group_objects_by_metaclass(module: &crate::module::Module) -> Vec<ObjGroup<'_>> {
    let mut index: FxHashMap<&str, usize> = FxHashMap::default();
    let mut groups: Vec<ObjGroup<'_>> = Vec::new();
    for obj in &module.objects {
        let start = module.anchors.start_offset(obj.anchor).unwrap_or(0);
        let len = module.anchors.length(obj.anchor).unwrap_or(0);
        let data = &module.objects_data.as_bytes()[start..start + len];

        let idx = *index.entry(obj.metaclass.as_str()).or_insert_with(|| {
            groups.push(ObjGroup {
                metaclass: obj.metaclass.as_str(),
                flags: 0,
                objects: Vec::new(),
            });
            groups.len() - 1
        });
        let group = &mut groups[idx];
        if obj.large_objects {
            group.flags |= OBJ_FLAG_LARGE;
        }
        if obj.transient {
            group.flags |= OBJ_FLAG_TRANSIENT;
        }
        group.objects.push(data);
    }
    groups
}

/// Assemble a complete image file from a finished [`crate::module::Module`]:
/// header, `ENTP`, `FNSD`, `MCLD`, `OBJS`, one `CPDF`+`CPPG*` run per pool,
/// `EOF`. Every anchor in `module` must already be resolved (§4.9 pool
/// layout has no notion of a pending fixup).
pub fn write_image<W: Write + Seek>(
    module: &crate::module::Module,
    out: W,
    options: ImageOptions,
    version: u16,
    timestamp: &str,
) -> Result<W, ImageError> {
    let mut w = ImageWriter::new(out, options);
    w.prepare(version, timestamp)?;

    let entry_ofs = module
        .entry_point
        .and_then(|a| module.anchors.start_offset(a))
        .unwrap_or(0) as u32;
    w.write_entrypt(
        entry_ofs,
        crate::module::METHOD_HEADER_SIZE as u16,
        10, // ExceptionTableEntry::encode's fixed size
        0,
        0,
        0,
        0,
        0,
    )?;

    if !module.function_sets.is_empty() {
        let names: Vec<String> = module
            .function_sets
            .iter()
            .map(|d| d.formatted())
            .collect();
        w.write_func_dep(&names)?;
    }

    if !module.metaclasses.is_empty() {
        let entries: Vec<(String, Vec<u16>)> = module
            .metaclasses
            .iter()
            .map(|m| (m.entry.formatted(), m.prop_ids.clone()))
            .collect();
        w.write_meta_dep(&entries)?;
    }

    let obj_groups = group_objects_by_metaclass(module);
    if !obj_groups.is_empty() {
        w.write_objs(&obj_groups)?;
    }

    write_pool(&mut w, POOL_CODE, module.code.as_bytes(), &options)?;
    write_pool(&mut w, POOL_CONST, module.constants.as_bytes(), &options)?;

    w.finish()
}

fn write_pool<W: Write + Seek>(
    w: &mut ImageWriter<W>,
    pool_id: u16,
    data: &[u8],
    options: &ImageOptions,
) -> Result<(), ImageError> {
    if data.is_empty() {
        return Ok(());
    }
    let page_size = options.page_size as usize;
    let pages: Vec<&[u8]> = data.chunks(page_size).collect();
    w.write_pool_def(pool_id, pages.len() as u32, options.page_size, true)?;
    for (idx, page) in pages.iter().enumerate() {
        w.write_pool_page(pool_id, idx as u32, page, true, options.xor_mask)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ts() -> String {
        "2024-01-01 00:00:00".to_string() + "....."
    }

    #[test]
    fn header_then_eof_round_trips_block_framing() {
        let mut w = ImageWriter::new(Cursor::new(Vec::new()), ImageOptions::default());
        w.prepare(1, &ts()).unwrap();
        let buf = w.finish().unwrap().into_inner();
        // signature + version + reserved + tool_id + timestamp
        let header_len = SIGNATURE.len() + 2 + HEADER_RESERVED + TOOL_ID_LEN + TIMESTAMP_LEN;
        assert_eq!(&buf[header_len..header_len + 4], b"EOF ");
        let size = u32::from_le_bytes(buf[header_len + 4..header_len + 8].try_into().unwrap());
        assert_eq!(size, 0);
    }

    #[test]
    fn block_framing_size_lands_exactly_on_next_block() {
        let mut w = ImageWriter::new(Cursor::new(Vec::new()), ImageOptions::default());
        w.prepare(1, &ts()).unwrap();
        w.begin_block(TAG_FNSD, true).unwrap();
        w.write_bytes(&[1, 2, 3, 4, 5]).unwrap();
        let buf = w.finish().unwrap().into_inner();
        let header_len = SIGNATURE.len() + 2 + HEADER_RESERVED + TOOL_ID_LEN + TIMESTAMP_LEN;
        let size = u32::from_le_bytes(
            buf[header_len + 4..header_len + 8]
                .try_into()
                .unwrap(),
        ) as usize;
        assert_eq!(size, 5);
        let next_block_start = header_len + 10 + size;
        assert_eq!(&buf[next_block_start..next_block_start + 4], b"EOF ");
    }

    #[test]
    fn opening_a_new_block_closes_the_previous_one() {
        let mut w = ImageWriter::new(Cursor::new(Vec::new()), ImageOptions::default());
        w.prepare(1, &ts()).unwrap();
        w.begin_block(TAG_FNSD, true).unwrap();
        w.write_bytes(&[9, 9]).unwrap();
        w.begin_block(TAG_MCLD, false).unwrap(); // implicitly closes FNSD
        w.write_bytes(&[1]).unwrap();
        let buf = w.finish().unwrap().into_inner();
        let header_len = SIGNATURE.len() + 2 + HEADER_RESERVED + TOOL_ID_LEN + TIMESTAMP_LEN;
        let fnsd_size =
            u32::from_le_bytes(buf[header_len + 4..header_len + 8].try_into().unwrap());
        assert_eq!(fnsd_size, 2);
        let mcld_start = header_len + 10 + 2;
        assert_eq!(&buf[mcld_start..mcld_start + 4], b"MCLD");
    }

    #[test]
    fn pool_page_xor_round_trips() {
        let mut w = ImageWriter::new(Cursor::new(Vec::new()), ImageOptions::default());
        w.prepare(1, &ts()).unwrap();
        w.write_pool_page(1, 0, &[1, 2, 3], true, 0xAB).unwrap();
        let buf = w.finish().unwrap().into_inner();
        let header_len = SIGNATURE.len() + 2 + HEADER_RESERVED + TOOL_ID_LEN + TIMESTAMP_LEN;
        // tag(4)+size(4)+flags(2) then pool_id(2)+page_index(4)+xor_mask(1)
        let payload_start = header_len + 10 + 7;
        let page = &buf[payload_start..payload_start + 3];
        let unmasked: Vec<u8> = page.iter().map(|b| b ^ 0xAB).collect();
        assert_eq!(unmasked, vec![1, 2, 3]);
    }

    #[test]
    fn xor_zero_is_identity() {
        let mut w = ImageWriter::new(Cursor::new(Vec::new()), ImageOptions::default());
        w.prepare(1, &ts()).unwrap();
        w.write_pool_page(1, 0, &[7, 8, 9], true, 0).unwrap();
        let buf = w.finish().unwrap().into_inner();
        let header_len = SIGNATURE.len() + 2 + HEADER_RESERVED + TOOL_ID_LEN + TIMESTAMP_LEN;
        let payload_start = header_len + 10 + 7;
        assert_eq!(&buf[payload_start..payload_start + 3], &[7, 8, 9]);
    }

    #[test]
    fn fix_pool_def_patches_page_count_after_the_fact() {
        let mut w = ImageWriter::new(Cursor::new(Vec::new()), ImageOptions::default());
        w.prepare(1, &ts()).unwrap();
        let def_ofs = w.write_pool_def(1, 0, 4096, true).unwrap();
        w.write_pool_page(1, 0, &[1], true, 0).unwrap();
        w.write_pool_page(1, 1, &[2], true, 0).unwrap();
        w.fix_pool_def(def_ofs, 2).unwrap();
        let buf = w.finish().unwrap().into_inner();
        let page_count_ofs = (def_ofs as usize) + 12;
        let count =
            u32::from_le_bytes(buf[page_count_ofs..page_count_ofs + 4].try_into().unwrap());
        assert_eq!(count, 2);
    }

    #[test]
    fn meta_dep_prop_list_count_is_fixed_up() {
        let mut w = ImageWriter::new(Cursor::new(Vec::new()), ImageOptions::default());
        w.prepare(1, &ts()).unwrap();
        w.write_meta_dep(&[("tadsobject/000001".to_string(), vec![1, 2, 3])])
            .unwrap();
        let buf = w.finish().unwrap().into_inner();
        let header_len = SIGNATURE.len() + 2 + HEADER_RESERVED + TOOL_ID_LEN + TIMESTAMP_LEN;
        // tag+size+flags(10) + count(2) + len-prefixed name
        let name_len = "tadsobject/000001".len();
        let propcnt_ofs = header_len + 10 + 2 + 1 + name_len;
        let count = u16::from_le_bytes(buf[propcnt_ofs..propcnt_ofs + 2].try_into().unwrap());
        assert_eq!(count, 3);
    }

    #[test]
    fn dependency_names_length_prefixed() {
        let mut w = ImageWriter::new(Cursor::new(Vec::new()), ImageOptions::default());
        w.prepare(1, &ts()).unwrap();
        w.write_func_dep(&["tads-gen/000001".to_string()]).unwrap();
        let buf = w.finish().unwrap().into_inner();
        let header_len = SIGNATURE.len() + 2 + HEADER_RESERVED + TOOL_ID_LEN + TIMESTAMP_LEN;
        let count_ofs = header_len + 10;
        let count = u16::from_le_bytes(buf[count_ofs..count_ofs + 2].try_into().unwrap());
        assert_eq!(count, 1);
        let len_byte = buf[count_ofs + 2];
        assert_eq!(len_byte as usize, "tads-gen/000001".len());
    }

    #[test]
    fn write_image_emits_entp_and_ends_with_eof() {
        use crate::module::Module;
        let mut module = Module::new();
        module.code.write_u8(0xC0);
        let cursor = Cursor::new(Vec::new());
        let buf = write_image(&module, cursor, ImageOptions::default(), 1, &ts())
            .unwrap()
            .into_inner();
        let header_len = SIGNATURE.len() + 2 + HEADER_RESERVED + TOOL_ID_LEN + TIMESTAMP_LEN;
        assert_eq!(&buf[header_len..header_len + 4], b"ENTP");
        assert_eq!(&buf[buf.len() - 10..buf.len() - 6], b"EOF ");
    }

    #[test]
    fn write_objs_groups_by_metaclass_with_union_flags() {
        let mut w = ImageWriter::new(Cursor::new(Vec::new()), ImageOptions::default());
        w.prepare(1, &ts()).unwrap();
        let groups = vec![ObjGroup {
            metaclass: "tadsobject",
            flags: OBJ_FLAG_LARGE,
            objects: vec![&[1, 2, 3][..], &[4, 5][..]],
        }];
        w.write_objs(&groups).unwrap();
        let buf = w.finish().unwrap().into_inner();
        let header_len = SIGNATURE.len() + 2 + HEADER_RESERVED + TOOL_ID_LEN + TIMESTAMP_LEN;
        assert_eq!(&buf[header_len..header_len + 4], b"OBJS");
        // group_count(2) + name_len(1) + "tadsobject"(10) + flags(2) + object_count(2)
        let group_count_ofs = header_len + 10;
        let group_count = u16::from_le_bytes(buf[group_count_ofs..group_count_ofs + 2].try_into().unwrap());
        assert_eq!(group_count, 1);
        let name_len_ofs = group_count_ofs + 2;
        assert_eq!(buf[name_len_ofs] as usize, "tadsobject".len());
        let flags_ofs = name_len_ofs + 1 + "tadsobject".len();
        let flags = u16::from_le_bytes(buf[flags_ofs..flags_ofs + 2].try_into().unwrap());
        assert_eq!(flags, OBJ_FLAG_LARGE);
        let obj_count_ofs = flags_ofs + 2;
        let obj_count = u16::from_le_bytes(buf[obj_count_ofs..obj_count_ofs + 2].try_into().unwrap());
        assert_eq!(obj_count, 2);
        let first_len_ofs = obj_count_ofs + 2;
        let first_len = u32::from_le_bytes(buf[first_len_ofs..first_len_ofs + 4].try_into().unwrap());
        assert_eq!(first_len, 3);
        let first_data_ofs = first_len_ofs + 4;
        assert_eq!(&buf[first_data_ofs..first_data_ofs + 3], &[1, 2, 3]);
    }

    #[test]
    fn write_image_with_objects_emits_an_objs_block_and_no_third_pool() {
        use crate::anchor::StreamId;
        use crate::module::{Module, ObjectDef};

        let mut module = Module::new();
        let anchor = module.anchors.create(StreamId::Object);
        module.anchors.define(anchor, 0).unwrap();
        module.objects_data.write_u8(0xAB);
        module.objects_data.write_u8(0xCD);
        module.anchors.set_length(anchor, 2);
        module.objects.push(ObjectDef {
            name: "thing".to_string(),
            metaclass: "tadsobject".to_string(),
            anchor,
            large_objects: false,
            transient: false,
        });

        let cursor = Cursor::new(Vec::new());
        let buf = write_image(&module, cursor, ImageOptions::default(), 1, &ts())
            .unwrap()
            .into_inner();
        assert!(buf.windows(4).any(|w| w == b"OBJS"));

        // every CPDF's pool id must be 1 (code) or 2 (constants), never 3.
        let mut pos = 0;
        while let Some(rel) = buf[pos..].windows(4).position(|w| w == b"CPDF") {
            let tag_ofs = pos + rel;
            let pool_id_ofs = tag_ofs + 10;
            let pool_id = u16::from_le_bytes(buf[pool_id_ofs..pool_id_ofs + 2].try_into().unwrap());
            assert!(pool_id == 1 || pool_id == 2);
            pos = tag_ofs + 4;
        }
    }

    #[test]
    fn write_image_skips_empty_pools() {
        use crate::module::Module;
        let module = Module::new();
        let cursor = Cursor::new(Vec::new());
        let buf = write_image(&module, cursor, ImageOptions::default(), 1, &ts())
            .unwrap()
            .into_inner();
        assert!(!buf.windows(4).any(|w| w == b"CPDF"));
    }
}

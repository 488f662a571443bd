//! Addressed fragments of firmware data
//!
//! Devices usually accept firmware in page or packet sized pieces. A
//! [`Chunk`] carries one such piece with its absolute address, and may be
//! subdivided again for memories with more than one level of banking.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};
use crate::flags::ExportFlags;
use crate::manifest::ManifestNode;
use crate::util::ascii_safe;

/// One addressed fragment of firmware data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    idx: u32,
    page: u32,
    address: u64,
    data: Vec<u8>,
    chunks: Vec<Chunk>,
}

impl Chunk {
    /// Create a chunk
    pub fn new(idx: u32, address: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            idx,
            address,
            data: data.into(),
            ..Default::default()
        }
    }

    /// Position in the chunk list
    pub fn idx(&self) -> u32 {
        self.idx
    }

    /// Set the position in the chunk list
    pub fn set_idx(&mut self, idx: u32) {
        self.idx = idx;
    }

    /// Page the chunk belongs to
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Set the page the chunk belongs to
    pub fn set_page(&mut self, page: u32) {
        self.page = page;
    }

    /// Absolute address of the first byte
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Chunk payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Nested sub-chunks
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Append a nested sub-chunk
    pub fn add_chunk(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    /// Split `data` into chunks of at most `packet_size` bytes
    ///
    /// When `page_size` is nonzero no chunk crosses a page boundary and each
    /// chunk records the page it falls in. A `packet_size` of zero means
    /// "as large as the page allows".
    pub fn split(data: &[u8], address: u64, page_size: u64, packet_size: usize) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut offset = 0usize;

        while offset < data.len() {
            let addr = address + offset as u64;
            let mut len = data.len() - offset;
            if packet_size > 0 {
                len = len.min(packet_size);
            }
            let mut page = 0;
            if page_size > 0 {
                let room = page_size - addr % page_size;
                len = len.min(usize::try_from(room).unwrap_or(usize::MAX));
                page = u32::try_from(addr / page_size).unwrap_or(u32::MAX);
            }

            let mut chunk = Chunk::new(chunks.len() as u32, addr, &data[offset..offset + len]);
            chunk.page = page;
            chunks.push(chunk);
            offset += len;
        }
        chunks
    }

    /// Populate a chunk from a `<chunk>` manifest element
    pub fn build(node: &ManifestNode) -> Result<Self> {
        let mut chunk = Chunk::default();
        if let Some(idx) = node.uint_of("idx")? {
            chunk.idx = u32::try_from(idx)
                .map_err(|_| Error::InvalidData(format!("chunk idx 0x{:x} out of range", idx)))?;
        }
        if let Some(page) = node.uint_of("page")? {
            chunk.page = u32::try_from(page)
                .map_err(|_| Error::InvalidData(format!("chunk page 0x{:x} out of range", page)))?;
        }
        if let Some(addr) = node.uint_of("addr")? {
            chunk.address = addr;
        }
        if let Some(data) = node.text_of("data") {
            chunk.data = STANDARD
                .decode(data.trim())
                .map_err(|e| Error::InvalidData(format!("chunk data is not base64: {}", e)))?;
        }
        for child in node.query_all("chunks/chunk") {
            chunk.chunks.push(Chunk::build(child)?);
        }
        Ok(chunk)
    }

    /// Describe the chunk into a `<chunk>` manifest element
    pub fn export(&self, flags: ExportFlags, node: &mut ManifestNode) {
        node.insert_kx("idx", u64::from(self.idx));
        node.insert_kx("page", u64::from(self.page));
        node.insert_kx("addr", self.address);
        if !self.data.is_empty() {
            let text = if flags.contains(ExportFlags::ASCII_DATA) {
                ascii_safe(&self.data, 0x100)
            } else {
                STANDARD.encode(&self.data)
            };
            let data = node.add_child(ManifestNode::with_text("data", text));
            data.set_attr("size", format!("0x{:x}", self.data.len()));
        }
        if !self.chunks.is_empty() {
            let list = node.add_child(ManifestNode::new("chunks"));
            for chunk in &self.chunks {
                chunk.export(flags, list.add_child(ManifestNode::new("chunk")));
            }
        }
    }
}

//! The firmware node
//!
//! A [`Firmware`] is one level of a firmware image tree: generic state in a
//! [`FirmwareBase`] plus a boxed [`FirmwareFormat`] supplying the hooks for
//! one concrete format. Children are owned by their parent; each child
//! records its parent's [`NodeId`] as a non-owning back-reference which is
//! cleared whenever the child is detached or the parent is dropped.

mod build;
mod export;
mod format;
mod images;
mod parse;

use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

pub use format::{FirmwareFormat, RawFirmware};
pub use images::DEPTH_MAX;
pub use parse::SEARCH_MAGIC_BUFSZ_MAX;

use crate::checksum::ChecksumKind;
use crate::chunk::Chunk;
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::flags::{FirmwareFlags, ParseFlags};
use crate::stream::{Blob, ByteStream};
use crate::util::format_size;
use crate::version::VersionFormat;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a firmware node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a node is in the parse pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParseState {
    /// Never parsed
    #[default]
    Unparsed,
    /// Looking for the format magic
    Validating,
    /// Running the format tokenizer
    Tokenizing,
    /// Running the format parser
    Parsing,
    /// Parsed successfully
    Done,
    /// The parse failed
    Failed,
}

/// The payload of a node: nothing, a buffer, or a lazily read stream
#[derive(Debug, Clone, Default)]
pub enum Payload {
    /// No payload set
    #[default]
    Empty,
    /// Fully materialized bytes
    Buffer(Blob),
    /// Bounded stream view with its size recorded when it was set
    Stream {
        /// The view
        stream: ByteStream,
        /// Size in bytes
        size: u64,
    },
}

/// A pending byte-range replacement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Offset into the payload
    pub offset: usize,
    /// Replacement bytes
    pub data: Vec<u8>,
}

/// Format-independent state of a firmware node
#[derive(Debug)]
pub struct FirmwareBase {
    node_id: NodeId,
    parent: Option<NodeId>,
    flags: FirmwareFlags,
    state: ParseState,
    id: Option<String>,
    idx: u64,
    version: Option<String>,
    version_raw: u64,
    version_format: VersionFormat,
    filename: Option<String>,
    addr: u64,
    offset: u64,
    size: u64,
    size_max: u64,
    alignment: u8,
    images_max: usize,
    depth: u32,
    payload: Payload,
    chunks: Option<Vec<Chunk>>,
    patches: Vec<Patch>,
    images: Vec<Firmware>,
}

impl Drop for FirmwareBase {
    fn drop(&mut self) {
        for img in &mut self.images {
            img.base.parent = None;
        }
    }
}

impl FirmwareBase {
    fn new() -> Self {
        Self {
            node_id: NodeId::next(),
            parent: None,
            flags: FirmwareFlags::empty(),
            state: ParseState::Unparsed,
            id: None,
            idx: 0,
            version: None,
            version_raw: 0,
            version_format: VersionFormat::Unknown,
            filename: None,
            addr: 0,
            offset: 0,
            size: 0,
            size_max: 0,
            alignment: 0,
            images_max: 0,
            depth: 0,
            payload: Payload::Empty,
            chunks: None,
            patches: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Identity of this node
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Identity of the parent, `None` for a root or detached node
    pub fn parent_id(&self) -> Option<NodeId> {
        self.parent
    }

    /// Node flags
    pub fn flags(&self) -> FirmwareFlags {
        self.flags
    }

    /// Check a node flag
    pub fn has_flag(&self, flag: FirmwareFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Set a node flag
    pub fn add_flag(&mut self, flag: FirmwareFlags) {
        self.flags.insert(flag);
    }

    /// Clear a node flag
    pub fn remove_flag(&mut self, flag: FirmwareFlags) {
        self.flags.remove(flag);
    }

    /// Parse pipeline state
    pub fn parse_state(&self) -> ParseState {
        self.state
    }

    /// Optional name
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Set the name
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Ordering key
    pub fn idx(&self) -> u64 {
        self.idx
    }

    /// Set the ordering key
    pub fn set_idx(&mut self, idx: u64) {
        self.idx = idx;
    }

    /// Display version
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Set the display version
    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = Some(version.into());
    }

    /// Raw numeric version, 0 if unset
    pub fn version_raw(&self) -> u64 {
        self.version_raw
    }

    /// Record a raw version without re-rendering the display version
    ///
    /// [`Firmware::set_version_raw`] also runs the format's conversion.
    pub fn store_version_raw(&mut self, version_raw: u64) {
        self.version_raw = version_raw;
    }

    /// How the raw version is rendered
    pub fn version_format(&self) -> VersionFormat {
        self.version_format
    }

    /// Record a version format without re-rendering the display version
    pub fn store_version_format(&mut self, version_format: VersionFormat) {
        self.version_format = version_format;
    }

    /// File the payload was loaded from
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Set the file the payload was loaded from
    pub fn set_filename(&mut self, filename: impl Into<String>) {
        self.filename = Some(filename.into());
    }

    /// Base address
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Set the base address
    pub fn set_addr(&mut self, addr: u64) {
        self.addr = addr;
    }

    /// Offset inside the parent or input
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Set the offset inside the parent or input
    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Size of the node
    ///
    /// An explicit size wins, then the stream size, then the buffer length.
    pub fn size(&self) -> u64 {
        if self.size != 0 {
            return self.size;
        }
        match &self.payload {
            Payload::Stream { size, .. } => *size,
            Payload::Buffer(blob) => blob.len() as u64,
            Payload::Empty => 0,
        }
    }

    /// Set an explicit size, 0 to derive it from the payload
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Largest input accepted by parse, 0 for unlimited
    pub fn size_max(&self) -> u64 {
        self.size_max
    }

    /// Set the largest input accepted by parse
    pub fn set_size_max(&mut self, size_max: u64) {
        self.size_max = size_max;
    }

    /// Alignment exponent, 0 for none
    pub fn alignment(&self) -> u8 {
        self.alignment
    }

    /// Set the alignment exponent
    pub fn set_alignment(&mut self, alignment: u8) {
        self.alignment = alignment;
    }

    /// Child count limit, 0 for unlimited
    pub fn images_max(&self) -> usize {
        self.images_max
    }

    /// Set the child count limit
    pub fn set_images_max(&mut self, images_max: usize) {
        self.images_max = images_max;
    }

    /// Nesting level, 0 for a root
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Current payload representation
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Set a buffer payload, replacing any stream
    pub fn set_bytes(&mut self, data: impl Into<Blob>) {
        self.payload = Payload::Buffer(data.into());
    }

    /// Set a stream payload, recording its size now
    pub fn set_stream(&mut self, stream: ByteStream) -> Result<()> {
        let size = stream.size().context("failed to get stream size")?;
        self.payload = Payload::Stream { stream, size };
        Ok(())
    }

    /// Buffer payload only, never read from a stream
    fn buffer(&self) -> Option<&Blob> {
        match &self.payload {
            Payload::Buffer(blob) => Some(blob),
            _ => None,
        }
    }

    /// Raw payload, read from the stream if needed
    pub fn bytes(&self) -> Result<Blob> {
        match &self.payload {
            Payload::Buffer(blob) => Ok(blob.clone()),
            Payload::Stream { size: 0, .. } => Err(Error::InvalidData("stream size unknown".into())),
            Payload::Stream { stream, size } => {
                let len = usize::try_from(*size)
                    .map_err(|_| Error::InvalidData(format!("stream of 0x{:x} bytes too large", size)))?;
                Ok(Blob::from(stream.read_bytes(0, len)?))
            }
            Payload::Empty => Err(Error::NotFound("no payload set".into())),
        }
    }

    /// Payload with every patch applied to a copy
    ///
    /// Stream payloads are read into memory first so patches always apply.
    pub fn bytes_with_patches(&self) -> Result<Blob> {
        let blob = self.bytes()?;
        if self.patches.is_empty() {
            return Ok(blob);
        }
        let mut buf = blob.to_vec();
        for patch in &self.patches {
            let end = patch.offset.checked_add(patch.data.len());
            match end {
                Some(end) if end <= buf.len() => buf[patch.offset..end].copy_from_slice(&patch.data),
                _ => {
                    return Err(Error::InvalidData(format!(
                        "0x{:x} bytes do not fit in buffer of size 0x{:x}",
                        patch.data.len(),
                        buf.len()
                    ))
                    .prefix(format!("failed to apply patch @0x{:x}", patch.offset)))
                }
            }
        }
        Ok(Blob::from(buf))
    }

    /// Readable view of the payload
    pub fn stream(&self) -> Result<ByteStream> {
        match &self.payload {
            Payload::Stream { stream, .. } => Ok(stream.clone()),
            Payload::Buffer(blob) => Ok(ByteStream::from_blob(blob.clone())),
            Payload::Empty => Err(Error::NotFound("no payload set".into())),
        }
    }

    /// Add a patch, replacing one with the same offset and length
    pub fn add_patch(&mut self, offset: usize, data: impl Into<Vec<u8>>) {
        let data = data.into();
        if let Some(existing) = self
            .patches
            .iter_mut()
            .find(|p| p.offset == offset && p.data.len() == data.len())
        {
            existing.data = data;
            return;
        }
        self.patches.push(Patch { offset, data });
    }

    /// Pending patches in insertion order
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Explicit chunks, or one chunk spanning the buffer payload
    pub fn chunks(&self) -> Result<Vec<Chunk>> {
        if let Some(chunks) = &self.chunks {
            return Ok(chunks.clone());
        }
        let blob = self.buffer().ok_or_else(|| Error::NotFound("no bytes or chunks found in firmware".into()))?;
        let idx = u32::try_from(self.idx)
            .map_err(|_| Error::InvalidData(format!("idx 0x{:x} does not fit in a chunk", self.idx)))?;
        Ok(vec![Chunk::new(idx, self.addr, blob.to_vec())])
    }

    /// Replace the explicit chunk list
    pub fn set_chunks(&mut self, chunks: Vec<Chunk>) {
        self.chunks = Some(chunks);
    }

    /// Append an explicit chunk
    pub fn add_chunk(&mut self, chunk: Chunk) {
        self.chunks.get_or_insert_with(Vec::new).push(chunk);
    }

    /// Up to `chunk_sz_max` payload bytes starting at an absolute address
    pub fn write_chunk(&self, address: u64, chunk_sz_max: usize) -> Result<Vec<u8>> {
        if address < self.addr {
            return Err(Error::Internal(format!(
                "requested address 0x{:x} less than base address 0x{:x}",
                address, self.addr
            )));
        }
        let blob = self.buffer().ok_or_else(|| Error::NotFound("no bytes found in firmware".into()))?;
        let offset = address - self.addr;
        if offset > blob.len() as u64 {
            return Err(Error::NotFound(format!(
                "offset 0x{:x} larger than data size 0x{:x}",
                offset,
                blob.len()
            )));
        }
        let offset = offset as usize;
        let end = offset + chunk_sz_max.min(blob.len() - offset);
        Ok(blob[offset..end].to_vec())
    }

    /// Check a raw payload size against the alignment
    pub fn check_alignment(&self, size: u64) -> Result<()> {
        if self.alignment == 0 {
            return Ok(());
        }
        let align = 1u64 << self.alignment.min(63);
        if size % align != 0 {
            return Err(Error::InvalidFile(format!(
                "raw firmware is not aligned to 0x{:x} ({})",
                align,
                format_size(align)
            )));
        }
        Ok(())
    }
}

/// A firmware node: generic state plus the hooks of one format
#[derive(Debug)]
pub struct Firmware {
    base: FirmwareBase,
    format: Box<dyn FirmwareFormat>,
}

impl Firmware {
    /// Create an empty node of the given format
    pub fn new<F: FirmwareFormat>(format: F) -> Self {
        Self::from_boxed(Box::new(format))
    }

    /// Create an empty node from a boxed format
    pub fn from_boxed(format: Box<dyn FirmwareFormat>) -> Self {
        let mut base = FirmwareBase::new();
        format.init(&mut base);
        Self { base, format }
    }

    /// Create an empty generic node
    pub fn raw() -> Self {
        Self::new(RawFirmware)
    }

    /// Create a generic node holding `data`
    pub fn from_bytes(data: impl Into<Blob>) -> Self {
        let mut fw = Self::raw();
        fw.set_bytes(data);
        fw
    }

    /// Format-independent state
    pub fn base(&self) -> &FirmwareBase {
        &self.base
    }

    /// Mutable format-independent state
    pub fn base_mut(&mut self) -> &mut FirmwareBase {
        &mut self.base
    }

    /// Format hooks
    pub fn format(&self) -> &dyn FirmwareFormat {
        self.format.as_ref()
    }

    /// Format name, e.g. `firmware` for the generic node
    pub fn type_name(&self) -> &'static str {
        self.format.type_name()
    }

    /// Downcast the format to a concrete type
    pub fn format_as<T: FirmwareFormat>(&self) -> Option<&T> {
        self.format.as_any().downcast_ref::<T>()
    }

    /// Mutably downcast the format to a concrete type
    pub fn format_as_mut<T: FirmwareFormat>(&mut self) -> Option<&mut T> {
        self.format.as_any_mut().downcast_mut::<T>()
    }

    /// Set the raw version and re-render the display version
    pub fn set_version_raw(&mut self, version_raw: u64) {
        self.base.version_raw = version_raw;
        if let Some(version) = self.format.convert_version(&self.base, version_raw) {
            self.base.version = Some(version);
        }
    }

    /// Set the version format, re-rendering an existing raw version
    pub fn set_version_format(&mut self, version_format: VersionFormat) {
        if self.base.version_format == version_format {
            return;
        }
        self.base.version_format = version_format;
        if self.base.version.is_some() && self.base.version_raw != 0 {
            self.set_version_raw(self.base.version_raw);
        }
    }

    /// Serialize the node to bytes
    pub fn write(&self) -> Result<Vec<u8>> {
        self.format.write(&self.base)
    }

    /// Serialize the node to a file, creating parent directories
    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = self.write()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Hex digest of the node
    ///
    /// The format's own checksum is preferred; otherwise the buffer, the
    /// stream, or the written bytes are hashed, in that order.
    pub fn checksum(&self, kind: ChecksumKind) -> Result<String> {
        match self.format.checksum(&self.base, kind) {
            Ok(checksum) => return Ok(checksum),
            Err(e) if e.kind() != ErrorKind::NotSupported => return Err(e),
            Err(_) => {}
        }
        match &self.base.payload {
            Payload::Buffer(blob) => Ok(kind.compute(blob)),
            Payload::Stream { stream, .. } => kind.compute_stream(stream),
            Payload::Empty => Ok(kind.compute(&self.write()?)),
        }
    }

    /// Check whether `other` could replace this node
    pub fn check_compatible(&self, other: &Firmware, flags: ParseFlags) -> Result<()> {
        self.format.check_compatible(&self.base, other, flags)
    }
}

impl Default for Firmware {
    fn default() -> Self {
        Self::raw()
    }
}

impl Deref for Firmware {
    type Target = FirmwareBase;

    fn deref(&self) -> &FirmwareBase {
        &self.base
    }
}

impl DerefMut for Firmware {
    fn deref_mut(&mut self) -> &mut FirmwareBase {
        &mut self.base
    }
}

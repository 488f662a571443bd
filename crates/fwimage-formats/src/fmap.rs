//! FMAP (Flash Map) firmware
//!
//! FMAP is a format used primarily by Chromebook firmware to describe
//! flash regions. The FMAP structure can be embedded anywhere in the
//! flash image; each non-empty area becomes one child image.
//!
//! Reference: https://chromium.googlesource.com/chromiumos/platform/flashmap

use std::any::Any;

use fwimage_core::version::version_from_u16;
use fwimage_core::{
    ByteStream, Error, ExportFlags, Firmware, FirmwareBase, FirmwareFormat, ManifestNode, ParseFlags,
    Result, VersionFormat,
};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// FMAP signature: "__FMAP__"
pub const FMAP_SIGNATURE: &[u8; 8] = b"__FMAP__";

/// Maximum supported FMAP major version
const FMAP_VER_MAJOR: u8 = 1;

/// Version written by [`FmapFirmware`]
const FMAP_VER_MINOR: u8 = 1;

/// Size of FMAP header
const FMAP_HEADER_SIZE: usize = 56;

/// Size of FMAP area
const FMAP_AREA_SIZE: usize = 42;

const FMAP_NAME_LEN: usize = 32;

/// FMAP area flags
pub mod flags {
    /// Area is static (read-only)
    pub const STATIC: u16 = 1 << 0;
    /// Area is compressed
    pub const COMPRESSED: u16 = 1 << 1;
    /// Area is read-only
    pub const RO: u16 = 1 << 2;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FmapHeader {
    signature: [u8; 8],
    ver_major: u8,
    ver_minor: u8,
    base: U64,
    size: U32,
    name: [u8; FMAP_NAME_LEN],
    nareas: U16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FmapArea {
    offset: U32,
    size: U32,
    name: [u8; FMAP_NAME_LEN],
    flags: U16,
}

/// Search for a valid FMAP header in data
fn find_fmap(data: &[u8]) -> Option<usize> {
    if data.len() < FMAP_HEADER_SIZE {
        return None;
    }

    for offset in 0..=(data.len() - FMAP_HEADER_SIZE) {
        if &data[offset..offset + 8] == FMAP_SIGNATURE && validate_fmap(&data[offset..]).is_ok() {
            return Some(offset);
        }
    }

    None
}

/// Check the header and that the area table fits
fn validate_fmap(data: &[u8]) -> Result<FmapHeader> {
    let (hdr, _) = FmapHeader::read_from_prefix(data)
        .map_err(|_| Error::InvalidFile("FMAP header truncated".into()))?;
    if &hdr.signature != FMAP_SIGNATURE {
        return Err(Error::InvalidFile("FMAP signature invalid".into()));
    }
    if hdr.ver_major > FMAP_VER_MAJOR {
        return Err(Error::NotSupported(format!(
            "FMAP version {}.{} not supported",
            hdr.ver_major, hdr.ver_minor
        )));
    }
    let required_size = FMAP_HEADER_SIZE + usize::from(hdr.nareas.get()) * FMAP_AREA_SIZE;
    if data.len() < required_size {
        return Err(Error::InvalidFile(format!(
            "FMAP area table needs 0x{:x} bytes, only 0x{:x} available",
            required_size,
            data.len()
        )));
    }
    Ok(hdr)
}

/// Parse a NUL-terminated FMAP string
fn parse_fmap_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

fn write_fmap_string(name: &str) -> Result<[u8; FMAP_NAME_LEN]> {
    let mut buf = [0u8; FMAP_NAME_LEN];
    // keep a terminating NUL
    if name.len() >= FMAP_NAME_LEN {
        return Err(Error::InvalidData(format!(
            "FMAP name {} too long, limit is {} bytes",
            name,
            FMAP_NAME_LEN - 1
        )));
    }
    buf[..name.len()].copy_from_slice(name.as_bytes());
    Ok(buf)
}

/// A flash map and its areas
///
/// The map name is stored as the node id and the map base address as the
/// node address. Area flags are stored as each child's index.
#[derive(Debug, Default, Clone)]
pub struct FmapFirmware {
    fmap_offset: u64,
}

impl FmapFirmware {
    /// Registry name
    pub const TYPE_NAME: &'static str = "fmap";

    /// Where the FMAP header was found in the parsed image
    pub fn fmap_offset(&self) -> u64 {
        self.fmap_offset
    }
}

impl FirmwareFormat for FmapFirmware {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn init(&self, base: &mut FirmwareBase) {
        base.store_version_format(VersionFormat::Pair);
    }

    fn parse(&mut self, base: &mut FirmwareBase, stream: &ByteStream, _flags: ParseFlags) -> Result<()> {
        let data = stream.to_vec()?;
        let offset = find_fmap(&data).ok_or_else(|| Error::InvalidFile("did not find FMAP signature".into()))?;
        let hdr = validate_fmap(&data[offset..])?;
        self.fmap_offset = offset as u64;

        let name = parse_fmap_string(&hdr.name);
        log::debug!(
            "FMAP {} v{}.{} at 0x{:x}, {} areas",
            name,
            hdr.ver_major,
            hdr.ver_minor,
            offset,
            hdr.nareas.get()
        );
        if !name.is_empty() {
            base.set_id(name);
        }
        base.set_addr(hdr.base.get());
        let version_raw = u64::from(hdr.ver_major) << 8 | u64::from(hdr.ver_minor);
        base.store_version_raw(version_raw);
        if let Some(version) = self.convert_version(base, version_raw) {
            base.set_version(version);
        }

        let table = &data[offset + FMAP_HEADER_SIZE..];
        for i in 0..usize::from(hdr.nareas.get()) {
            let (area, _) = FmapArea::read_from_prefix(&table[i * FMAP_AREA_SIZE..])
                .map_err(|_| Error::InvalidFile(format!("FMAP area {} truncated", i)))?;

            // Skip zero-size areas
            if area.size.get() == 0 {
                continue;
            }

            let area_name = parse_fmap_string(&area.name);
            let area_offset = u64::from(area.offset.get());
            let area_size = u64::from(area.size.get());
            if area_offset + area_size > data.len() as u64 {
                return Err(Error::InvalidFile(format!(
                    "FMAP area {} @0x{:x} size 0x{:x} exceeds image size 0x{:x}",
                    area_name,
                    area_offset,
                    area_size,
                    data.len()
                )));
            }

            let mut img = Firmware::raw();
            img.set_id(area_name);
            img.set_idx(u64::from(area.flags.get()));
            img.set_addr(area_offset);
            img.set_offset(area_offset);
            img.set_stream(stream.slice(area_offset, area_size)?)?;
            base.add_image(img)?;
        }
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> Result<Vec<u8>> {
        let images = base.images();
        let nareas = u16::try_from(images.len())
            .map_err(|_| Error::InvalidData(format!("too many FMAP areas: {}", images.len())))?;

        let mut blobs = Vec::with_capacity(images.len());
        for img in images {
            blobs.push(img.write()?);
        }

        let mut offset = FMAP_HEADER_SIZE + images.len() * FMAP_AREA_SIZE;
        let mut areas = Vec::with_capacity(images.len());
        for (img, blob) in images.iter().zip(&blobs) {
            let area_flags = u16::try_from(img.idx())
                .map_err(|_| Error::InvalidData(format!("FMAP area flags 0x{:x} invalid", img.idx())))?;
            let area_offset = u32::try_from(offset)
                .map_err(|_| Error::InvalidData(format!("FMAP area offset 0x{:x} too large", offset)))?;
            let area_size = u32::try_from(blob.len())
                .map_err(|_| Error::InvalidData(format!("FMAP area size 0x{:x} too large", blob.len())))?;
            areas.push(FmapArea {
                offset: U32::new(area_offset),
                size: U32::new(area_size),
                name: write_fmap_string(img.id().unwrap_or_default())?,
                flags: U16::new(area_flags),
            });
            offset += blob.len();
        }

        let total = u32::try_from(offset)
            .map_err(|_| Error::InvalidData(format!("FMAP image size 0x{:x} too large", offset)))?;
        let hdr = FmapHeader {
            signature: *FMAP_SIGNATURE,
            ver_major: FMAP_VER_MAJOR,
            ver_minor: FMAP_VER_MINOR,
            base: U64::new(base.addr()),
            size: U32::new(total),
            name: write_fmap_string(base.id().unwrap_or_default())?,
            nareas: U16::new(nareas),
        };

        let mut buf = Vec::with_capacity(offset);
        buf.extend_from_slice(hdr.as_bytes());
        for area in &areas {
            buf.extend_from_slice(area.as_bytes());
        }
        for blob in &blobs {
            buf.extend_from_slice(blob);
        }
        Ok(buf)
    }

    fn export(&self, _base: &FirmwareBase, flags: ExportFlags, node: &mut ManifestNode) {
        if flags.contains(ExportFlags::INCLUDE_DEBUG) {
            node.insert_kx("fmap_offset", self.fmap_offset);
        }
    }

    fn check_compatible(&self, base: &FirmwareBase, other: &Firmware, _flags: ParseFlags) -> Result<()> {
        if other.format_as::<FmapFirmware>().is_none() {
            return Err(Error::NotSupported(format!(
                "cannot replace FMAP image with {}",
                other.type_name()
            )));
        }
        for img in base.images() {
            let Some(id) = img.id() else { continue };
            if other.image_by_id(id).is_err() {
                return Err(Error::NotFound(format!("FMAP area {} missing in new image", id)));
            }
        }
        Ok(())
    }

    fn convert_version(&self, base: &FirmwareBase, version_raw: u64) -> Option<String> {
        version_from_u16(u16::try_from(version_raw).ok()?, base.version_format())
    }
}

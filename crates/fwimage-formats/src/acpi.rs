//! ACPI table firmware
//!
//! Every ACPI table starts with the same 36 byte header. The four
//! character signature becomes the node id, the header `length` bounds the
//! table and all bytes of the table must sum to zero.

use std::any::Any;

use fwimage_core::{
    ByteStream, Error, ErrorKind, ExportFlags, FirmwareBase, FirmwareFlags, FirmwareFormat, ManifestNode, ParseFlags,
    Result,
};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of the common table header
pub const ACPI_HEADER_SIZE: usize = 36;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct AcpiHeader {
    signature: [u8; 4],
    length: U32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: U32,
    creator_id: [u8; 4],
    creator_revision: U32,
}

fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn parse_string(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes[..end]).to_string())
}

fn write_string<const N: usize>(field: &str, value: Option<&str>) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    let value = value.unwrap_or_default();
    if value.len() > N {
        return Err(Error::InvalidData(format!(
            "{} {} too long, limit is {} bytes",
            field, value, N
        )));
    }
    buf[..value.len()].copy_from_slice(value.as_bytes());
    Ok(buf)
}

/// A generic ACPI table
#[derive(Debug, Default, Clone)]
pub struct AcpiTable {
    revision: u8,
    oem_id: Option<String>,
    oem_table_id: Option<String>,
    oem_revision: u32,
    creator_id: Option<String>,
    creator_revision: u32,
}

impl AcpiTable {
    /// Registry name
    pub const TYPE_NAME: &'static str = "acpi-table";

    /// Table revision
    pub fn revision(&self) -> u8 {
        self.revision
    }

    /// OEM id, up to 6 characters
    pub fn oem_id(&self) -> Option<&str> {
        self.oem_id.as_deref()
    }

    /// OEM table id, up to 8 characters
    pub fn oem_table_id(&self) -> Option<&str> {
        self.oem_table_id.as_deref()
    }

    /// OEM revision
    pub fn oem_revision(&self) -> u32 {
        self.oem_revision
    }
}

impl FirmwareFormat for AcpiTable {
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
        base.add_flag(FirmwareFlags::HAS_CHECKSUM);
    }

    fn parse(&mut self, base: &mut FirmwareBase, stream: &ByteStream, flags: ParseFlags) -> Result<()> {
        let streamsz = stream.size()?;
        if streamsz < ACPI_HEADER_SIZE as u64 {
            return Err(Error::InvalidData(format!(
                "table too small, got 0x{:x} bytes, need 0x{:x}",
                streamsz, ACPI_HEADER_SIZE
            )));
        }
        let raw = stream.read_bytes(0, ACPI_HEADER_SIZE)?;
        let (hdr, _) = AcpiHeader::read_from_prefix(&raw)
            .map_err(|_| Error::InvalidData("table header truncated".into()))?;

        let signature = String::from_utf8_lossy(&hdr.signature).to_string();
        self.revision = hdr.revision;
        self.oem_id = parse_string(&hdr.oem_id);
        self.oem_table_id = parse_string(&hdr.oem_table_id);
        self.oem_revision = hdr.oem_revision.get();
        self.creator_id = parse_string(&hdr.creator_id);
        self.creator_revision = hdr.creator_revision.get();

        let length = u64::from(hdr.length.get());
        if length > streamsz || length < ACPI_HEADER_SIZE as u64 {
            return Err(Error::InvalidData(format!(
                "table length not valid: got 0x{:x} but expected 0x{:x}",
                streamsz, length
            )));
        }

        let table = stream.read_bytes(0, length as usize)?;
        let checksum_actual = sum8(&table);
        if checksum_actual != 0 {
            if !flags.contains(ParseFlags::IGNORE_CHECKSUM) {
                return Err(Error::InvalidFile(format!(
                    "CRC failed, expected 0x{:02x}, got 0x{:02x}",
                    hdr.checksum.wrapping_sub(checksum_actual),
                    hdr.checksum
                )));
            }
            log::warn!("ignoring bad checksum on ACPI table {}", signature);
        }

        log::debug!("ACPI table {} rev 0x{:x}, 0x{:x} bytes", signature, hdr.revision, length);
        base.set_id(signature);
        base.set_size(length);
        base.set_bytes(table[ACPI_HEADER_SIZE..].to_vec());
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> Result<Vec<u8>> {
        let id = base
            .id()
            .ok_or_else(|| Error::NotFound("ACPI table signature not set".into()))?;
        if id.len() != 4 || !id.is_ascii() {
            return Err(Error::InvalidData(format!(
                "ACPI table signature {} must be 4 ASCII characters",
                id
            )));
        }
        let body = match base.bytes_with_patches() {
            Ok(blob) => blob.to_vec(),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let length = u32::try_from(ACPI_HEADER_SIZE + body.len())
            .map_err(|_| Error::InvalidData(format!("ACPI table of 0x{:x} bytes too large", body.len())))?;

        let mut hdr = AcpiHeader {
            signature: write_string::<4>("signature", Some(id))?,
            length: U32::new(length),
            revision: self.revision,
            checksum: 0,
            oem_id: write_string::<6>("oem_id", self.oem_id.as_deref())?,
            oem_table_id: write_string::<8>("oem_table_id", self.oem_table_id.as_deref())?,
            oem_revision: U32::new(self.oem_revision),
            creator_id: write_string::<4>("creator_id", self.creator_id.as_deref())?,
            creator_revision: U32::new(self.creator_revision),
        };
        hdr.checksum = sum8(hdr.as_bytes()).wrapping_add(sum8(&body)).wrapping_neg();

        let mut buf = Vec::with_capacity(length as usize);
        buf.extend_from_slice(hdr.as_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    fn export(&self, _base: &FirmwareBase, _flags: ExportFlags, node: &mut ManifestNode) {
        node.insert_kx("revision", u64::from(self.revision));
        node.insert_kv("oem_id", self.oem_id.as_deref());
        node.insert_kv("oem_table_id", self.oem_table_id.as_deref());
        node.insert_kx("oem_revision", u64::from(self.oem_revision));
        node.insert_kv("creator_id", self.creator_id.as_deref());
        node.insert_kx("creator_revision", u64::from(self.creator_revision));
    }

    fn build(&mut self, _base: &mut FirmwareBase, node: &ManifestNode) -> Result<()> {
        if let Some(value) = node.uint_of("revision")? {
            self.revision = u8::try_from(value)
                .map_err(|_| Error::InvalidData(format!("revision 0x{:x} out of range", value)))?;
        }
        if let Some(value) = node.text_of("oem_id") {
            self.oem_id = Some(value.to_string());
        }
        if let Some(value) = node.text_of("oem_table_id") {
            self.oem_table_id = Some(value.to_string());
        }
        if let Some(value) = node.uint_of("oem_revision")? {
            self.oem_revision = u32::try_from(value)
                .map_err(|_| Error::InvalidData(format!("oem_revision 0x{:x} out of range", value)))?;
        }
        if let Some(value) = node.text_of("creator_id") {
            self.creator_id = Some(value.to_string());
        }
        if let Some(value) = node.uint_of("creator_revision")? {
            self.creator_revision = u32::try_from(value)
                .map_err(|_| Error::InvalidData(format!("creator_revision 0x{:x} out of range", value)))?;
        }
        Ok(())
    }
}

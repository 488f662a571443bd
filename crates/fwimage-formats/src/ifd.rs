//! Intel Flash Descriptor (IFD) firmware
//!
//! The Intel Flash Descriptor is located at the beginning of flash chips
//! on Intel platforms. It contains the flash region table; every used
//! region becomes one [`IfdRegion`] child image.

use std::any::Any;

use fwimage_core::{
    ByteStream, Error, ExportFlags, Firmware, FirmwareBase, FirmwareFlags, FirmwareFormat, ManifestNode,
    ParseFlags, Payload, Result,
};

/// IFD signature at offset 0x10
pub const IFD_SIGNATURE: u32 = 0x0FF0_A55A;

/// Offset of the signature from the start of the descriptor
const IFD_SIGNATURE_OFFSET: u64 = 0x10;

/// Smallest descriptor, also the size of the descriptor region
const IFD_SIZE_MIN: u64 = 0x1000;

/// Maximum number of IFD regions
const MAX_IFD_REGIONS: usize = 16;

/// IFD region names (based on Intel documentation)
const IFD_REGION_NAMES: [&str; MAX_IFD_REGIONS] = [
    "descriptor", // 0: Flash Descriptor
    "bios",       // 1: BIOS
    "me",         // 2: Intel ME
    "gbe",        // 3: Gigabit Ethernet
    "platform",   // 4: Platform Data
    "devexp",     // 5: Device Expansion
    "bios2",      // 6: Secondary BIOS
    "ec",         // 7: Embedded Controller
    "ie",         // 8: Innovation Engine
    "10gbe",      // 9: 10 Gigabit Ethernet
    "oprom",      // 10: Option ROM
    "region11",   // 11: Reserved
    "region12",   // 12: Reserved
    "region13",   // 13: Reserved
    "region14",   // 14: Reserved
    "ptt",        // 15: Platform Trust Technology
];

/// Regions that can brick the system
const DANGEROUS_REGIONS: [&str; 3] = ["me", "descriptor", "ptt"];

/// Regions that should never be written
const READONLY_REGIONS: [&str; 1] = ["descriptor"];

/// Decode a FREG register into an inclusive `(base, end)` range
///
/// Returns `None` for an unused region, where the limit is below the base.
fn decode_freg(freg: u32) -> Option<(u64, u64)> {
    let base = (freg & 0x7FFF) << 12;
    let limit = ((freg >> 16) & 0x7FFF) << 12;
    if limit < base {
        return None;
    }
    Some((u64::from(base), u64::from(limit | 0xFFF)))
}

/// Encode an inclusive `(base, end)` range as a FREG register
fn encode_freg(base: u64, end: u64) -> Result<u32> {
    if base % IFD_SIZE_MIN != 0 || (end + 1) % IFD_SIZE_MIN != 0 || end < base {
        return Err(Error::InvalidData(format!(
            "region 0x{:x}-0x{:x} is not 4 KiB aligned",
            base, end
        )));
    }
    let base = base >> 12;
    let limit = end >> 12;
    if limit > 0x7FFF {
        return Err(Error::InvalidData(format!("region end 0x{:x} too large", end)));
    }
    Ok(((limit as u32) << 16) | base as u32)
}

/// Last byte a FREG limit can describe
const IFD_REGION_END_MAX: u64 = 0x07FF_FFFF;

/// Exclusive end of a region, bounded by what a FREG can encode
fn region_end(img: &Firmware) -> Result<u64> {
    img.addr()
        .checked_add(img.size())
        .filter(|&end| end <= IFD_REGION_END_MAX + 1)
        .ok_or_else(|| {
            Error::InvalidData(format!(
                "IFD region {} @0x{:x} size 0x{:x} exceeds 0x{:x}",
                img.id().unwrap_or("unknown"),
                img.addr(),
                img.size(),
                IFD_REGION_END_MAX
            ))
        })
}

/// Unused region: limit below base
const FREG_UNUSED: u32 = 0x0000_7FFF;

/// An Intel Flash Descriptor and its regions
#[derive(Debug, Clone)]
pub struct IfdFirmware {
    flmap0: u32,
    flmap1: u32,
    flmap2: u32,
}

impl Default for IfdFirmware {
    fn default() -> Self {
        Self {
            // NR=7 (8 regions), FRBA=0x40
            flmap0: (7 << 24) | (0x04 << 16),
            flmap1: 0,
            flmap2: 0,
        }
    }
}

impl IfdFirmware {
    /// Registry name
    pub const TYPE_NAME: &'static str = "ifd";

    /// Number of regions described by FLMAP0
    pub fn num_regions(&self) -> usize {
        let nr = ((self.flmap0 >> 24) & 0x07) as usize;
        std::cmp::min(nr + 1, MAX_IFD_REGIONS)
    }

    /// Flash region base address, from FLMAP0
    pub fn frba(&self) -> u64 {
        u64::from((self.flmap0 >> 12) & 0xFF0)
    }
}

impl FirmwareFormat for IfdFirmware {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn has_validator(&self) -> bool {
        true
    }

    fn validate(&self, stream: &ByteStream, offset: u64) -> Result<()> {
        let sig = stream.read_u32_le(offset + IFD_SIGNATURE_OFFSET)?;
        if sig != IFD_SIGNATURE {
            return Err(Error::InvalidFile(format!(
                "IFD signature invalid, got 0x{:08x}, expected 0x{:08x}",
                sig, IFD_SIGNATURE
            )));
        }
        Ok(())
    }

    fn parse(&mut self, base: &mut FirmwareBase, stream: &ByteStream, _flags: ParseFlags) -> Result<()> {
        let streamsz = stream.size()?;
        if streamsz < IFD_SIZE_MIN {
            return Err(Error::InvalidFile(format!(
                "IFD too small, got 0x{:x} bytes, need 0x{:x}",
                streamsz, IFD_SIZE_MIN
            )));
        }

        self.flmap0 = stream.read_u32_le(0x14)?;
        self.flmap1 = stream.read_u32_le(0x18)?;
        self.flmap2 = stream.read_u32_le(0x1C)?;

        let frba = self.frba();
        let num_regions = self.num_regions();
        if frba + num_regions as u64 * 4 > streamsz {
            return Err(Error::InvalidFile(format!(
                "IFD region table at 0x{:x} exceeds image size 0x{:x}",
                frba, streamsz
            )));
        }

        for (i, &name) in IFD_REGION_NAMES.iter().enumerate().take(num_regions) {
            let freg = stream.read_u32_le(frba + i as u64 * 4)?;
            let Some((start, end)) = decode_freg(freg) else {
                continue;
            };
            let size = end - start + 1;

            let mut img = Firmware::new(IfdRegion {
                readonly: READONLY_REGIONS.contains(&name),
                dangerous: DANGEROUS_REGIONS.contains(&name),
            });
            img.set_id(name);
            img.set_idx(i as u64);
            img.set_addr(start);
            img.set_offset(start);
            img.set_size(size);
            if end < streamsz {
                img.set_stream(stream.slice(start, size)?)?;
            } else {
                log::debug!("IFD region {} @0x{:x} is outside the image", name, start);
            }
            base.add_image(img)?;
        }
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> Result<Vec<u8>> {
        let mut buf = match base.payload() {
            Payload::Empty => Vec::new(),
            _ => base.bytes_with_patches()?.to_vec(),
        };
        let mut total = IFD_SIZE_MIN;
        for img in base.images() {
            total = total.max(region_end(img)?);
        }
        let total = usize::try_from(total)
            .map_err(|_| Error::InvalidData(format!("IFD image size 0x{:x} too large", total)))?;
        if buf.len() < total {
            buf.resize(total, 0xFF);
        }

        for img in base.images() {
            if matches!(img.payload(), Payload::Empty) {
                continue;
            }
            let blob = img.write()?;
            let start = usize::try_from(img.addr())
                .map_err(|_| Error::InvalidData(format!("IFD region address 0x{:x} too large", img.addr())))?;
            let end = start
                .checked_add(blob.len())
                .filter(|&end| end as u64 <= IFD_REGION_END_MAX + 1)
                .ok_or_else(|| {
                    Error::InvalidData(format!(
                        "IFD region @0x{:x} with 0x{:x} bytes does not fit in the descriptor",
                        start,
                        blob.len()
                    ))
                })?;
            if buf.len() < end {
                buf.resize(end, 0xFF);
            }
            buf[start..end].copy_from_slice(&blob);
        }

        buf[0x10..0x14].copy_from_slice(&IFD_SIGNATURE.to_le_bytes());
        buf[0x14..0x18].copy_from_slice(&self.flmap0.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&self.flmap1.to_le_bytes());
        buf[0x1C..0x20].copy_from_slice(&self.flmap2.to_le_bytes());

        let frba = self.frba() as usize;
        for i in 0..self.num_regions() {
            let freg = match base.image_by_idx(i as u64) {
                Ok(img) if img.size() == 0 => {
                    return Err(Error::InvalidData(format!(
                        "IFD region {} has no size",
                        img.id().unwrap_or("unknown")
                    )))
                }
                Ok(img) => encode_freg(img.addr(), region_end(img)? - 1)?,
                Err(_) => FREG_UNUSED,
            };
            let off = frba + i * 4;
            if buf.len() < off + 4 {
                return Err(Error::InvalidData(format!("IFD region table at 0x{:x} out of range", frba)));
            }
            buf[off..off + 4].copy_from_slice(&freg.to_le_bytes());
        }
        Ok(buf)
    }

    fn export(&self, _base: &FirmwareBase, _flags: ExportFlags, node: &mut ManifestNode) {
        node.insert_kx("descriptor_map0", u64::from(self.flmap0));
        node.insert_kx("descriptor_map1", u64::from(self.flmap1));
        node.insert_kx("descriptor_map2", u64::from(self.flmap2));
    }

    fn build(&mut self, _base: &mut FirmwareBase, node: &ManifestNode) -> Result<()> {
        for (name, field) in [
            ("descriptor_map0", &mut self.flmap0),
            ("descriptor_map1", &mut self.flmap1),
            ("descriptor_map2", &mut self.flmap2),
        ] {
            if let Some(value) = node.uint_of(name)? {
                *field = u32::try_from(value)
                    .map_err(|_| Error::InvalidData(format!("{} 0x{:x} out of range", name, value)))?;
            }
        }
        Ok(())
    }
}

/// One region of an Intel Flash Descriptor
#[derive(Debug, Default, Clone)]
pub struct IfdRegion {
    readonly: bool,
    dangerous: bool,
}

impl IfdRegion {
    /// Registry name
    pub const TYPE_NAME: &'static str = "ifd-region";

    /// Region should never be written
    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Writing the region can brick the system
    pub fn dangerous(&self) -> bool {
        self.dangerous
    }
}

impl FirmwareFormat for IfdRegion {
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
        base.add_flag(FirmwareFlags::NO_AUTO_DETECTION);
    }

    fn export(&self, _base: &FirmwareBase, _flags: ExportFlags, node: &mut ManifestNode) {
        node.insert_kb("readonly", self.readonly);
        node.insert_kb("dangerous", self.dangerous);
    }

    fn build(&mut self, _base: &mut FirmwareBase, node: &ManifestNode) -> Result<()> {
        if let Some(readonly) = node.bool_of("readonly")? {
            self.readonly = readonly;
        }
        if let Some(dangerous) = node.bool_of("dangerous")? {
            self.dangerous = dangerous;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwimage_core::{ErrorKind, FormatRegistry};

    fn make_test_ifd() -> Vec<u8> {
        let mut data = vec![0xFF; 0x4000];

        // Signature at 0x10
        data[0x10..0x14].copy_from_slice(&IFD_SIGNATURE.to_le_bytes());

        // FLMAP0: NR=2 (3 regions), FRBA=0x40
        let flmap0: u32 = (2 << 24) | (0x04 << 16);
        data[0x14..0x18].copy_from_slice(&flmap0.to_le_bytes());

        // Region 0 (descriptor): 0x0000 - 0x0FFF
        data[0x40..0x44].copy_from_slice(&0u32.to_le_bytes());
        // Region 1 (bios): 0x1000 - 0x2FFF
        let freg1: u32 = (0x0002 << 16) | 0x0001;
        data[0x44..0x48].copy_from_slice(&freg1.to_le_bytes());
        // Region 2 (me): unused
        data[0x48..0x4C].copy_from_slice(&FREG_UNUSED.to_le_bytes());

        data[0x1000..0x1004].copy_from_slice(b"BIOS");
        data
    }

    #[test]
    fn test_freg() {
        assert_eq!(decode_freg(0), Some((0, 0xFFF)));
        assert_eq!(decode_freg((0x07FF << 16) | 0x0001), Some((0x1000, 0x7FFFFF)));
        assert_eq!(decode_freg(FREG_UNUSED), None);
        assert_eq!(encode_freg(0x1000, 0x7FFFFF).unwrap(), (0x07FF << 16) | 0x0001);
        assert!(encode_freg(0x800, 0xFFF).is_err());
    }

    #[test]
    fn test_parse_ifd() {
        let mut fw = Firmware::new(IfdFirmware::default());
        fw.parse_bytes(make_test_ifd(), 0, ParseFlags::empty()).unwrap();

        assert_eq!(fw.images().len(), 2);
        let desc = fw.image_by_id("descriptor").unwrap();
        assert_eq!(desc.addr(), 0);
        assert_eq!(desc.size(), 0x1000);
        let region = desc.format_as::<IfdRegion>().unwrap();
        assert!(region.readonly());
        assert!(region.dangerous());

        let bios = fw.image_by_id("bios").unwrap();
        assert_eq!(bios.idx(), 1);
        assert_eq!(bios.addr(), 0x1000);
        assert_eq!(bios.size(), 0x2000);
        assert_eq!(&bios.bytes().unwrap()[..4], b"BIOS");
        assert!(!bios.format_as::<IfdRegion>().unwrap().dangerous());
    }

    #[test]
    fn test_magic_search() {
        let mut data = vec![0u8; 0x20];
        data.extend(make_test_ifd());
        let mut fw = Firmware::new(IfdFirmware::default());
        fw.parse_bytes(data, 0, ParseFlags::empty()).unwrap();
        assert_eq!(fw.offset(), 0x20);
        assert_eq!(&fw.image_by_id("bios").unwrap().bytes().unwrap()[..4], b"BIOS");

        let mut data = vec![0u8; 0x20];
        data.extend(make_test_ifd());
        let mut fw = Firmware::new(IfdFirmware::default());
        let err = fw.parse_bytes(data, 0, ParseFlags::NO_SEARCH).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
    }

    #[test]
    fn test_parse_too_small() {
        let mut data = vec![0xFFu8; 0x100];
        data[0x10..0x14].copy_from_slice(&IFD_SIGNATURE.to_le_bytes());
        let mut fw = Firmware::new(IfdFirmware::default());
        let err = fw.parse_bytes(data, 0, ParseFlags::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
    }

    #[test]
    fn test_region_outside_image() {
        let mut data = make_test_ifd();
        data.truncate(0x2000);
        let mut fw = Firmware::new(IfdFirmware::default());
        fw.parse_bytes(data, 0, ParseFlags::empty()).unwrap();
        let bios = fw.image_by_id("bios").unwrap();
        assert_eq!(bios.size(), 0x2000);
        assert!(matches!(bios.payload(), Payload::Empty));
    }

    #[test]
    fn test_write_then_parse() {
        let data = make_test_ifd();
        let mut fw = Firmware::new(IfdFirmware::default());
        fw.parse_bytes(data.clone(), 0, ParseFlags::empty()).unwrap();
        assert_eq!(fw.write().unwrap(), data);
    }

    #[test]
    fn test_region_manifest() {
        let mut registry = FormatRegistry::new();
        crate::register_all(&mut registry);
        let fw = registry
            .build_from_xml(
                r#"<firmware type="ifd">
  <descriptor_map0>0x2040000</descriptor_map0>
  <firmware type="ifd-region">
    <id>bios</id>
    <idx>0x1</idx>
    <addr>0x1000</addr>
    <readonly>true</readonly>
    <data size="0x1000">QklPUw==</data>
  </firmware>
</firmware>"#,
            )
            .unwrap();
        let bios = fw.image_by_id("bios").unwrap();
        assert!(bios.format_as::<IfdRegion>().unwrap().readonly());
        assert!(bios.has_flag(FirmwareFlags::NO_AUTO_DETECTION));

        let node = fw.export(ExportFlags::empty());
        assert_eq!(node.text_of("descriptor_map0"), Some("0x2040000"));
        let region = node.child("firmware").unwrap();
        assert_eq!(region.attr("type"), Some("ifd-region"));
        assert_eq!(region.text_of("readonly"), Some("true"));
        assert!(region.child("dangerous").is_none());

        let blob = fw.write().unwrap();
        assert_eq!(blob.len(), 0x2000);
        assert_eq!(&blob[0x1000..0x1004], b"BIOS");
        let mut parsed = Firmware::new(IfdFirmware::default());
        parsed.parse_bytes(blob, 0, ParseFlags::empty()).unwrap();
        assert_eq!(parsed.image_by_id("bios").unwrap().addr(), 0x1000);
    }

    #[test]
    fn test_write_region_out_of_range() {
        let mut registry = FormatRegistry::new();
        crate::register_all(&mut registry);
        for (addr, size) in [("0xfffffffffffff000", "0x2000"), ("0x8000000", "0x1000")] {
            let xml = format!(
                r#"<firmware type="ifd">
  <firmware type="ifd-region">
    <idx>0x1</idx>
    <addr>{}</addr>
    <size>{}</size>
    <data>YQ==</data>
  </firmware>
</firmware>"#,
                addr, size
            );
            let fw = registry.build_from_xml(&xml).unwrap();
            let err = fw.write().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidData, "{}", err);
        }
    }
}

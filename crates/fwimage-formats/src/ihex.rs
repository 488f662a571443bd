//! Intel HEX firmware
//!
//! A text format of `:`-prefixed records, each carrying a byte count, a
//! 16 bit address, a record type, data and a two's complement checksum.
//! Data records are joined into one contiguous payload starting at the
//! first data address; holes are filled with the padding value. Signature
//! records become a child image with the id `signature`.

use std::any::Any;

use fwimage_core::{
    ByteStream, Error, ExportFlags, Firmware, FirmwareBase, FirmwareFormat, ManifestNode, ParseFlags, Result,
};

/// Record types
pub mod record_type {
    /// Data bytes at the current address
    pub const DATA: u8 = 0x00;
    /// End of file
    pub const EOF: u8 = 0x01;
    /// Segment base, shifted left by 4
    pub const EXTENDED_SEGMENT: u8 = 0x02;
    /// CS:IP start address
    pub const START_SEGMENT: u8 = 0x03;
    /// Upper 16 bits of the address
    pub const EXTENDED_LINEAR: u8 = 0x04;
    /// EIP start address
    pub const START_LINEAR: u8 = 0x05;
    /// Detached signature bytes
    pub const SIGNATURE: u8 = 0xFD;
}

/// Id of the child image holding signature records
pub const SIGNATURE_ID: &str = "signature";

/// Largest hole between data records that is filled with padding
const GAP_MAX: u64 = 0x100000;

/// Largest payload built when the node sets no `size_max`
const IMAGE_SIZE_MAX: u64 = 0x1000_0000;

/// Data bytes per written record
const DATA_LEN_MAX: usize = 16;

/// One tokenized record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IhexRecord {
    /// Line number, starting at 1
    pub ln: usize,
    /// Address field
    pub addr16: u16,
    /// Record type, see [`record_type`]
    pub record_type: u8,
    /// Data bytes
    pub data: Vec<u8>,
}

fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn emit_record(out: &mut String, record_type: u8, addr16: u16, data: &[u8]) {
    let mut buf = Vec::with_capacity(data.len() + 5);
    buf.push(data.len() as u8);
    buf.extend_from_slice(&addr16.to_be_bytes());
    buf.push(record_type);
    buf.extend_from_slice(data);
    buf.push(sum8(&buf).wrapping_neg());
    out.push(':');
    out.push_str(&hex::encode_upper(&buf));
    out.push('\n');
}

fn be16(rec: &IhexRecord) -> Result<u64> {
    match rec.data[..] {
        [hi, lo] => Ok(u64::from(u16::from_be_bytes([hi, lo]))),
        _ => Err(Error::InvalidFile(format!(
            "record type 0x{:02x} on line {} needs 2 bytes, got {}",
            rec.record_type,
            rec.ln,
            rec.data.len()
        ))),
    }
}

/// An Intel HEX file
#[derive(Debug, Default, Clone)]
pub struct IhexFirmware {
    records: Vec<IhexRecord>,
    padding_value: u8,
}

impl IhexFirmware {
    /// Registry name
    pub const TYPE_NAME: &'static str = "ihex";

    /// Records found by the last parse
    pub fn records(&self) -> &[IhexRecord] {
        &self.records
    }

    /// Byte used to fill holes between data records
    pub fn padding_value(&self) -> u8 {
        self.padding_value
    }

    /// Set the byte used to fill holes between data records
    pub fn set_padding_value(&mut self, padding_value: u8) {
        self.padding_value = padding_value;
    }

    fn tokenize_line(ln: usize, line: &str, flags: ParseFlags) -> Result<IhexRecord> {
        let Some(body) = line.strip_prefix(':') else {
            return Err(Error::InvalidFile(format!(
                "invalid starting token on line {}: {}",
                ln,
                line.chars().next().unwrap_or(' ')
            )));
        };
        let bytes = hex::decode(body)
            .map_err(|e| Error::InvalidData(format!("invalid hex on line {}: {}", ln, e)))?;
        if bytes.len() < 5 {
            return Err(Error::InvalidFile(format!("record on line {} too short", ln)));
        }
        let byte_cnt = usize::from(bytes[0]);
        if bytes.len() != byte_cnt + 5 {
            return Err(Error::InvalidFile(format!(
                "record on line {} has 0x{:x} bytes, expected 0x{:x}",
                ln,
                bytes.len(),
                byte_cnt + 5
            )));
        }

        let (payload, checksum) = bytes.split_at(bytes.len() - 1);
        let expected = sum8(payload).wrapping_neg();
        if checksum[0] != expected {
            if !flags.contains(ParseFlags::IGNORE_CHECKSUM) {
                return Err(Error::InvalidFile(format!(
                    "checksum on line {} invalid, got 0x{:02x}, expected 0x{:02x}",
                    ln, checksum[0], expected
                )));
            }
            log::warn!("ignoring bad checksum on line {}", ln);
        }

        Ok(IhexRecord {
            ln,
            addr16: u16::from_be_bytes([bytes[1], bytes[2]]),
            record_type: bytes[3],
            data: bytes[4..4 + byte_cnt].to_vec(),
        })
    }
}

impl FirmwareFormat for IhexFirmware {
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
        let token = stream.read_u8(offset)?;
        if token != b':' {
            return Err(Error::InvalidFile(format!(
                "invalid starting token, got 0x{:02x}, expected ':'",
                token
            )));
        }
        Ok(())
    }

    fn tokenize(&mut self, _base: &mut FirmwareBase, stream: &ByteStream, flags: ParseFlags) -> Result<()> {
        let data = stream.to_vec()?;
        let text = std::str::from_utf8(&data).map_err(|e| Error::InvalidData(format!("ihex is not text: {}", e)))?;

        self.records.clear();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim_end();
            // blank lines and ; comments
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let rec = Self::tokenize_line(i + 1, line, flags)?;
            let eof = rec.record_type == record_type::EOF;
            self.records.push(rec);
            if eof {
                break;
            }
        }
        Ok(())
    }

    fn parse(&mut self, base: &mut FirmwareBase, _stream: &ByteStream, _flags: ParseFlags) -> Result<()> {
        let mut buf: Vec<u8> = Vec::new();
        let mut signature: Vec<u8> = Vec::new();
        let mut img_addr: Option<u64> = None;
        let mut addr_last = 0u64;
        let mut upper = 0u64;
        let mut got_eof = false;
        let size_max = match base.size_max() {
            0 => IMAGE_SIZE_MAX,
            size_max => size_max,
        };

        for rec in &self.records {
            match rec.record_type {
                record_type::DATA => {
                    let abs = upper + u64::from(rec.addr16);
                    if img_addr.is_none() {
                        img_addr = Some(abs);
                        addr_last = abs;
                    }
                    if abs < addr_last {
                        return Err(Error::InvalidFile(format!(
                            "address 0x{:x} on line {} is before the previous data at 0x{:x}",
                            abs, rec.ln, addr_last
                        )));
                    }
                    let gap = abs - addr_last;
                    if gap > GAP_MAX {
                        return Err(Error::InvalidFile(format!(
                            "hole of 0x{:x} bytes before line {} too large to fill",
                            gap, rec.ln
                        )));
                    }
                    let len_new = buf.len() as u64 + gap + rec.data.len() as u64;
                    if len_new > size_max {
                        return Err(Error::InvalidFile(format!(
                            "data on line {} grows image to 0x{:x} bytes, limit is 0x{:x}",
                            rec.ln, len_new, size_max
                        )));
                    }
                    if gap > 0 {
                        log::trace!("padding 0x{:x} bytes before line {}", gap, rec.ln);
                        buf.resize(buf.len() + gap as usize, self.padding_value);
                    }
                    buf.extend_from_slice(&rec.data);
                    addr_last = abs + rec.data.len() as u64;
                }
                record_type::EOF => {
                    got_eof = true;
                }
                record_type::EXTENDED_SEGMENT => {
                    upper = be16(rec)? << 4;
                }
                record_type::EXTENDED_LINEAR => {
                    upper = be16(rec)? << 16;
                }
                record_type::START_SEGMENT | record_type::START_LINEAR => {
                    log::debug!("ignoring start address record on line {}", rec.ln);
                }
                record_type::SIGNATURE => {
                    signature.extend_from_slice(&rec.data);
                }
                other => {
                    return Err(Error::InvalidFile(format!(
                        "invalid record type 0x{:02x} on line {}",
                        other, rec.ln
                    )));
                }
            }
        }
        if !got_eof {
            return Err(Error::InvalidFile("no EOF, perhaps truncated file".into()));
        }

        if !signature.is_empty() {
            let mut img = Firmware::from_bytes(signature);
            img.set_id(SIGNATURE_ID);
            base.add_image(img)?;
        }
        base.set_addr(img_addr.unwrap_or(0));
        base.set_bytes(buf);
        Ok(())
    }

    fn write(&self, base: &FirmwareBase) -> Result<Vec<u8>> {
        let blob = base.bytes_with_patches()?;
        let addr = base.addr();
        let mut out = String::new();

        let mut upper = 0u64;
        let mut pos = 0usize;
        while pos < blob.len() {
            let abs = addr + pos as u64;
            if abs > u64::from(u32::MAX) {
                return Err(Error::InvalidData(format!("address 0x{:x} does not fit in ihex", abs)));
            }
            if abs >> 16 != upper {
                upper = abs >> 16;
                emit_record(&mut out, record_type::EXTENDED_LINEAR, 0, &(upper as u16).to_be_bytes());
            }
            let room = (0x10000 - (abs & 0xFFFF)) as usize;
            let len = DATA_LEN_MAX.min(room).min(blob.len() - pos);
            emit_record(&mut out, record_type::DATA, (abs & 0xFFFF) as u16, &blob[pos..pos + len]);
            pos += len;
        }

        if let Ok(img) = base.image_by_id(SIGNATURE_ID) {
            for chunk in img.write()?.chunks(DATA_LEN_MAX) {
                emit_record(&mut out, record_type::SIGNATURE, 0, chunk);
            }
        }
        emit_record(&mut out, record_type::EOF, 0, &[]);
        Ok(out.into_bytes())
    }

    fn export(&self, _base: &FirmwareBase, flags: ExportFlags, node: &mut ManifestNode) {
        node.insert_kx("padding_value", u64::from(self.padding_value));
        if flags.contains(ExportFlags::INCLUDE_DEBUG) {
            node.insert_kx("records", self.records.len() as u64);
        }
    }

    fn build(&mut self, _base: &mut FirmwareBase, node: &ManifestNode) -> Result<()> {
        if let Some(value) = node.uint_of("padding_value")? {
            self.padding_value = u8::try_from(value)
                .map_err(|_| Error::InvalidData(format!("padding_value 0x{:x} out of range", value)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwimage_core::ErrorKind;

    fn parse(text: &str, flags: ParseFlags) -> Result<Firmware> {
        let mut fw = Firmware::new(IhexFirmware::default());
        fw.parse_bytes(text.as_bytes().to_vec(), 0, flags)?;
        Ok(fw)
    }

    #[test]
    fn test_parse_simple() {
        let fw = parse(
            ":0400100001020304E2\n:020014000506DF\n:00000001FF\n",
            ParseFlags::empty(),
        )
        .unwrap();
        assert_eq!(fw.addr(), 0x10);
        assert_eq!(&*fw.bytes().unwrap(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(fw.format_as::<IhexFirmware>().unwrap().records().len(), 3);
    }

    #[test]
    fn test_parse_gap_and_linear() {
        let fw = parse(
            ":020000040001F9\n:0100000011EE\n:0100030022DA\n:00000001FF\n",
            ParseFlags::empty(),
        )
        .unwrap();
        assert_eq!(fw.addr(), 0x10000);
        assert_eq!(&*fw.bytes().unwrap(), &[0x11, 0, 0, 0x22]);
    }

    #[test]
    fn test_parse_checksum() {
        let text = ":0100000041BF\n:00000001FF\n";
        let err = parse(text, ParseFlags::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        assert!(err.to_string().contains("checksum on line 1 invalid"));

        let fw = parse(text, ParseFlags::IGNORE_CHECKSUM).unwrap();
        assert_eq!(&*fw.bytes().unwrap(), b"A");
    }

    #[test]
    fn test_parse_errors() {
        let err = parse(":0100000041BE\n", ParseFlags::empty()).unwrap_err();
        assert!(err.to_string().contains("no EOF"));

        let err = parse(":0100000041BE\nxyz\n", ParseFlags::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);

        let err = parse(":01000000\n", ParseFlags::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);

        let err = parse(":0100000741B7\n:00000001FF\n", ParseFlags::empty()).unwrap_err();
        assert!(err.to_string().contains("invalid record type 0x07"));

        let err = parse(":01001000AA45\n:0100000055AA\n:00000001FF\n", ParseFlags::empty()).unwrap_err();
        assert!(err.to_string().contains("before the previous data"));
    }

    #[test]
    fn test_comments_and_trailing() {
        let fw = parse(
            "; generated\r\n:0100000041BE\r\n\r\n:00000001FF\r\ntrailing junk\n",
            ParseFlags::empty(),
        )
        .unwrap();
        assert_eq!(&*fw.bytes().unwrap(), b"A");
    }

    #[test]
    fn test_signature_child() {
        let fw = parse(":020000FD010000\n:0100000041BE\n:00000001FF\n", ParseFlags::empty()).unwrap();
        let sig = fw.image_by_id(SIGNATURE_ID).unwrap();
        assert_eq!(&*sig.bytes().unwrap(), &[0x01, 0x00]);
    }

    #[test]
    fn test_write_then_parse() {
        let data: Vec<u8> = (0..40u8).collect();
        let mut fw = Firmware::new(IhexFirmware::default());
        fw.set_addr(0xFFF8);
        fw.set_bytes(data.clone());
        let mut sig = Firmware::from_bytes(vec![0xAA; 20]);
        sig.set_id(SIGNATURE_ID);
        fw.add_image(sig).unwrap();

        let text = String::from_utf8(fw.write().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], ":08FFF8000001020304050607E5");
        assert_eq!(lines[1], ":020000040001F9");
        assert_eq!(lines.last().copied(), Some(":00000001FF"));

        let parsed = parse(&text, ParseFlags::empty()).unwrap();
        assert_eq!(parsed.addr(), 0xFFF8);
        assert_eq!(&*parsed.bytes().unwrap(), &data[..]);
        assert_eq!(&*parsed.image_by_id(SIGNATURE_ID).unwrap().bytes().unwrap(), &[0xAA; 20][..]);
        assert_eq!(parsed.write().unwrap(), text.into_bytes());
    }

    #[test]
    fn test_padding_value_manifest() {
        let mut registry = fwimage_core::FormatRegistry::new();
        crate::register_all(&mut registry);
        let fw = registry
            .build_from_xml(r#"<firmware type="ihex"><padding_value>0xff</padding_value></firmware>"#)
            .unwrap();
        assert_eq!(fw.format_as::<IhexFirmware>().unwrap().padding_value(), 0xFF);
        let node = fw.export(ExportFlags::empty());
        assert_eq!(node.text_of("padding_value"), Some("0xff"));
    }

    #[test]
    fn test_image_size_limit() {
        // three bytes, each 1 MiB apart
        let mut text = String::new();
        for upper in [0x00u16, 0x10, 0x20] {
            emit_record(&mut text, record_type::EXTENDED_LINEAR, 0, &upper.to_be_bytes());
            emit_record(&mut text, record_type::DATA, 0, &[0xAA]);
        }
        emit_record(&mut text, record_type::EOF, 0, &[]);

        let mut fw = Firmware::new(IhexFirmware::default());
        fw.set_size_max(0x200000);
        let err = fw.parse_bytes(text.clone().into_bytes(), 0, ParseFlags::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        assert!(err.to_string().contains("limit is 0x200000"), "{}", err);

        let mut fw = Firmware::new(IhexFirmware::default());
        fw.set_size_max(0x200001);
        fw.parse_bytes(text.into_bytes(), 0, ParseFlags::empty()).unwrap();
        assert_eq!(fw.bytes().unwrap().len(), 0x200001);
    }
}

//! Describing a node tree as a manifest

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::{Firmware, Payload, RawFirmware};
use crate::flags::ExportFlags;
use crate::manifest::{xml, ManifestNode};
use crate::util::ascii_safe;
use crate::version::VersionFormat;

/// Largest stream payload, and ASCII rendering, included inline
const INLINE_DATA_MAX: usize = 0x100;

impl Firmware {
    /// Describe this node and its children as a `<firmware>` element
    ///
    /// Zero, empty and unknown fields are left out.
    pub fn export(&self, flags: ExportFlags) -> ManifestNode {
        let mut node = ManifestNode::new("firmware");
        self.export_into(flags, &mut node);
        node
    }

    fn export_into(&self, flags: ExportFlags, node: &mut ManifestNode) {
        let base = &self.base;
        if self.type_name() != RawFirmware::TYPE_NAME {
            node.set_attr("type", self.type_name());
        }

        let flag_str = base.flags.to_flag_string();
        node.insert_kv("flags", Some(flag_str.as_str()));
        node.insert_kv("id", base.id());
        node.insert_kx("idx", base.idx);
        node.insert_kv("version", base.version());
        node.insert_kx("version_raw", base.version_raw);
        if base.version_format != VersionFormat::Unknown {
            node.insert_kv("version_format", Some(base.version_format.as_str()));
        }
        node.insert_kx("addr", base.addr);
        node.insert_kx("offset", base.offset);
        node.insert_kx("alignment", u64::from(base.alignment));
        node.insert_kx("size", base.size);
        node.insert_kx("size_max", base.size_max);
        node.insert_kx("images_max", base.images_max as u64);
        node.insert_kv("filename", base.filename());
        if flags.contains(ExportFlags::INCLUDE_DEBUG) {
            node.insert_kx("depth", u64::from(base.depth));
        }

        match &base.payload {
            Payload::Stream { stream, size } => {
                let text = usize::try_from(*size)
                    .ok()
                    .filter(|&len| len <= INLINE_DATA_MAX)
                    .and_then(|len| stream.read_bytes(0, len).ok())
                    .map(|buf| render_data(&buf, flags));
                let data = node.add_child(ManifestNode::new("data"));
                data.set_text(text);
                data.set_attr("type", "stream");
                data.set_attr("size", format!("0x{:x}", size));
            }
            Payload::Buffer(blob) if blob.is_empty() => {
                let data = node.add_child(ManifestNode::new("data"));
                data.set_attr("type", "bytes");
            }
            Payload::Buffer(blob) => {
                let data = node.add_child(ManifestNode::with_text("data", render_data(blob, flags)));
                data.set_attr("type", "bytes");
                data.set_attr("size", format!("0x{:x}", blob.len()));
            }
            Payload::Empty => {}
        }

        if let Some(chunks) = base.chunks.as_ref().filter(|c| !c.is_empty()) {
            let list = node.add_child(ManifestNode::new("chunks"));
            for chunk in chunks {
                chunk.export(flags, list.add_child(ManifestNode::new("chunk")));
            }
        }

        self.format.export(base, flags, node);

        for img in &base.images {
            img.export_into(flags, node.add_child(ManifestNode::new("firmware")));
        }
    }

    /// Describe this node and its children as an XML document
    pub fn export_to_xml(&self, flags: ExportFlags) -> String {
        xml::to_xml(&self.export(flags))
    }
}

fn render_data(buf: &[u8], flags: ExportFlags) -> String {
    if flags.contains(ExportFlags::ASCII_DATA) {
        ascii_safe(buf, INLINE_DATA_MAX)
    } else {
        STANDARD.encode(buf)
    }
}

/// Debug rendering: the XML export with depth and ASCII payloads
impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.export_to_xml(ExportFlags::INCLUDE_DEBUG | ExportFlags::ASCII_DATA))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ByteStream;

    #[test]
    fn test_export_skips_defaults() {
        let mut fw = Firmware::raw();
        fw.set_id("main");
        fw.set_addr(0x1000);
        let node = fw.export(ExportFlags::empty());
        assert!(node.attr("type").is_none());
        assert_eq!(node.text_of("id"), Some("main"));
        assert_eq!(node.text_of("addr"), Some("0x1000"));
        assert!(node.child("offset").is_none());
        assert!(node.child("flags").is_none());
        assert!(node.child("data").is_none());
        assert!(node.child("depth").is_none());
    }

    #[test]
    fn test_export_data_modes() {
        let fw = Firmware::from_bytes(b"hi\x01".to_vec());
        let node = fw.export(ExportFlags::empty());
        let data = node.child("data").unwrap();
        assert_eq!(data.text(), Some("aGkB"));
        assert_eq!(data.attr("size"), Some("0x3"));

        let node = fw.export(ExportFlags::ASCII_DATA);
        assert_eq!(node.text_of("data"), Some("hi."));
    }

    #[test]
    fn test_export_large_stream_not_inlined() {
        let mut fw = Firmware::raw();
        fw.set_stream(ByteStream::from_bytes(vec![0u8; INLINE_DATA_MAX + 1]))
            .unwrap();
        let node = fw.export(ExportFlags::empty());
        let data = node.child("data").unwrap();
        assert_eq!(data.text(), None);
        assert_eq!(data.attr("type"), Some("stream"));
        assert_eq!(data.attr("size"), Some("0x101"));
    }

    #[test]
    fn test_display_includes_depth() {
        let mut root = Firmware::raw();
        root.add_image(Firmware::from_bytes(b"abc".to_vec())).unwrap();
        let text = root.to_string();
        assert!(text.contains("<depth>0x1</depth>"));
        assert!(text.contains(">abc</data>"));
    }
}

//! Populating a node tree from a manifest

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::{Firmware, DEPTH_MAX};
use crate::chunk::Chunk;
use crate::error::{Error, Result, ResultExt};
use crate::flags::{FirmwareFlags, ALIGNMENT_MAX};
use crate::manifest::{xml, ManifestNode};
use crate::registry::FormatRegistry;
use crate::version::VersionFormat;

fn checked_u32(name: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::InvalidData(format!("{} 0x{:x} out of range", name, value)))
}

impl Firmware {
    /// Populate this node from a `<firmware>` manifest element
    ///
    /// Nested `<firmware>` elements become child images created through
    /// `registry` from their `type` attribute, and are added with the same
    /// depth and dedupe checks as [`add_image`](super::FirmwareBase::add_image).
    pub fn build(&mut self, node: &ManifestNode, registry: &FormatRegistry) -> Result<()> {
        if let Some(flags) = node.text_of("flags") {
            let flags = FirmwareFlags::from_flag_string(flags)?;
            self.base.flags.insert(flags - FirmwareFlags::DONE_PARSE);
        }
        if let Some(version) = node.text_of("version") {
            self.base.set_version(version);
        }
        if let Some(version_format) = node.text_of("version_format") {
            self.set_version_format(version_format.parse::<VersionFormat>()?);
        }
        if let Some(version_raw) = node.uint_of("version_raw")? {
            self.set_version_raw(version_raw);
        }
        if let Some(id) = node.text_of("id") {
            self.base.set_id(id);
        }
        if let Some(idx) = node.uint_of("idx")? {
            self.base.set_idx(idx);
        }
        if let Some(addr) = node.uint_of("addr")? {
            self.base.set_addr(addr);
        }
        if let Some(offset) = node.uint_of("offset")? {
            self.base.set_offset(offset);
        }
        if let Some(size) = node.uint_of("size")? {
            self.base.set_size(size);
        }
        if let Some(size_max) = node.uint_of("size_max")? {
            self.base.set_size_max(size_max);
        }
        if let Some(images_max) = node.uint_of("images_max")? {
            self.base.set_images_max(checked_u32("images_max", images_max)? as usize);
        }
        if let Some(alignment) = node.uint_of("alignment")? {
            if alignment > u64::from(ALIGNMENT_MAX) {
                return Err(Error::InvalidData(format!(
                    "0x{:x} invalid, maximum is 0x{:x}",
                    alignment, ALIGNMENT_MAX
                )));
            }
            self.base.set_alignment(alignment as u8);
        }
        if let Some(filename) = node.text_of("filename") {
            let data = fs::read(filename).with_context(|| format!("failed to load {}", filename))?;
            self.base.set_bytes(data);
            self.base.set_filename(filename);
        }
        if let Some(data) = node.child("data") {
            self.build_data(data)?;
        }

        let chunks = node.query_all("chunks/chunk");
        if !chunks.is_empty() {
            let mut list = Vec::with_capacity(chunks.len());
            for (i, chunk_node) in chunks.into_iter().enumerate() {
                let mut chunk = Chunk::build(chunk_node)?;
                if chunk_node.child("idx").is_none() {
                    chunk.set_idx(checked_u32("chunk idx", i as u64)?);
                }
                list.push(chunk);
            }
            self.base.set_chunks(list);
        }

        for child_node in node.children_named("firmware") {
            if self.base.depth + 1 > DEPTH_MAX {
                return Err(Error::InvalidData(format!(
                    "images are nested too deep, limit is {}",
                    DEPTH_MAX
                )));
            }
            let mut child = match child_node.attr("type") {
                Some(name) => registry.create(name)?,
                None => Firmware::raw(),
            };
            child.base.depth = self.base.depth + 1;
            child.build(child_node, registry)?;
            self.base.add_image(child)?;
        }

        self.format.build(&mut self.base, node)
    }

    fn build_data(&mut self, data: &ManifestNode) -> Result<()> {
        let mut buf = match data.text().map(str::trim).filter(|t| !t.is_empty()) {
            Some(text) => STANDARD
                .decode(text)
                .map_err(|e| Error::InvalidData(format!("data is not valid base64: {}", e)))?,
            None => Vec::new(),
        };
        if let Some(size) = data.attr("size") {
            let size = crate::util::parse_number(size)
                .map_err(|e| Error::InvalidData(format!("data size {} invalid: {}", size, e)))?;
            let size = usize::try_from(size)
                .map_err(|_| Error::InvalidData(format!("data size 0x{:x} too large", size)))?;
            if buf.len() < size {
                buf.resize(size, 0x00);
            }
        }
        self.base.set_bytes(buf);
        Ok(())
    }

    /// Populate this node from an XML document with a `<firmware>` root
    pub fn build_from_xml(&mut self, xml: &str, registry: &FormatRegistry) -> Result<()> {
        self.build_root(&xml::from_xml(xml)?, registry)
    }

    /// Populate this node from a parsed `<firmware>` root element
    pub(crate) fn build_root(&mut self, root: &ManifestNode, registry: &FormatRegistry) -> Result<()> {
        if root.name() != "firmware" {
            return Err(Error::InvalidData(format!(
                "expected <firmware> root element, got <{}>",
                root.name()
            )));
        }
        self.build(root, registry)
    }

    /// Populate this node from an XML file
    pub fn build_from_file(&mut self, path: impl AsRef<Path>, registry: &FormatRegistry) -> Result<()> {
        let path = path.as_ref();
        let xml = fs::read_to_string(path).with_context(|| format!("failed to load {}", path.display()))?;
        self.build_from_xml(&xml, registry)
            .with_context(|| format!("failed to build {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::firmware::Payload;

    fn build(xml: &str) -> Result<Firmware> {
        let mut fw = Firmware::raw();
        fw.build_from_xml(xml, &FormatRegistry::new())?;
        Ok(fw)
    }

    #[test]
    fn test_build_scalars() {
        let fw = build(
            r#"<firmware>
  <version>1.2.3</version>
  <version_format>triplet</version_format>
  <id>main</id>
  <idx>0x2</idx>
  <addr>0x8000</addr>
  <offset>0x10</offset>
  <size>0x40</size>
  <size_max>0x1000</size_max>
  <alignment>0x4</alignment>
</firmware>"#,
        )
        .unwrap();
        assert_eq!(fw.version(), Some("1.2.3"));
        assert_eq!(fw.version_format(), VersionFormat::Triplet);
        assert_eq!(fw.id(), Some("main"));
        assert_eq!(fw.idx(), 2);
        assert_eq!(fw.addr(), 0x8000);
        assert_eq!(fw.offset(), 0x10);
        assert_eq!(fw.size(), 0x40);
        assert_eq!(fw.size_max(), 0x1000);
        assert_eq!(fw.alignment(), 4);
    }

    #[test]
    fn test_build_version_raw() {
        let fw = build(
            "<firmware><version_format>quad</version_format><version_raw>0x01020304</version_raw></firmware>",
        )
        .unwrap();
        assert_eq!(fw.version(), Some("1.2.3.4"));
    }

    #[test]
    fn test_build_invalid_fields() {
        let err = build("<firmware><version_format>quintuple</version_format></firmware>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        let err = build("<firmware><alignment>0x20</alignment></firmware>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        let err = build("<firmware><data>***</data></firmware>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        let err = build(r#"<firmware><firmware type="nonexistent"/></firmware>"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = build("<image/>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_build_data_padding() {
        let fw = build(r#"<firmware><data size="0x8">aGVsbG8=</data></firmware>"#).unwrap();
        assert_eq!(&*fw.bytes().unwrap(), b"hello\0\0\0");

        let fw = build("<firmware><data/></firmware>").unwrap();
        assert!(matches!(fw.payload(), Payload::Buffer(b) if b.is_empty()));
    }

    #[test]
    fn test_build_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"from disk").unwrap();

        let xml = format!("<firmware><filename>{}</filename></firmware>", path.display());
        let fw = build(&xml).unwrap();
        assert_eq!(&*fw.bytes().unwrap(), b"from disk");
        assert_eq!(fw.filename(), Some(path.to_str().unwrap()));

        let xml = format!(
            "<firmware><filename>{}</filename></firmware>",
            dir.path().join("missing").display()
        );
        assert_eq!(build(&xml).unwrap_err().kind(), ErrorKind::Io);
    }

    #[test]
    fn test_build_chunks() {
        let fw = build(
            r#"<firmware>
  <chunks>
    <chunk><addr>0x100</addr><data>YQ==</data></chunk>
    <chunk><addr>0x200</addr><data>Yg==</data></chunk>
  </chunks>
</firmware>"#,
        )
        .unwrap();
        let chunks = fw.chunks().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].idx(), 1);
        assert_eq!(chunks[1].address(), 0x200);
        assert_eq!(chunks[1].data(), b"b");
    }

    #[test]
    fn test_build_children_dedupe() {
        let fw = build(
            r#"<firmware>
  <flags>dedupe-id</flags>
  <firmware><id>x</id><data>Zmlyc3Q=</data></firmware>
  <firmware><id>x</id><data>c2Vjb25k</data></firmware>
</firmware>"#,
        )
        .unwrap();
        assert_eq!(fw.images().len(), 1);
        assert_eq!(&*fw.image_by_id("x").unwrap().bytes().unwrap(), b"second");
        assert_eq!(fw.images()[0].depth(), 1);
        assert_eq!(fw.images()[0].parent_id(), Some(fw.node_id()));
    }

    #[test]
    fn test_build_depth_limit() {
        let depth = DEPTH_MAX as usize + 1;
        let xml = format!(
            "<firmware>{}{}</firmware>",
            "<firmware>".repeat(depth),
            "</firmware>".repeat(depth)
        );
        let err = build(&xml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let depth = DEPTH_MAX as usize;
        let xml = format!(
            "<firmware>{}{}</firmware>",
            "<firmware>".repeat(depth),
            "</firmware>".repeat(depth)
        );
        build(&xml).unwrap();
    }

    #[test]
    fn test_build_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.xml");
        std::fs::write(&path, "<firmware><id>disk</id></firmware>").unwrap();
        let mut fw = Firmware::raw();
        fw.build_from_file(&path, &FormatRegistry::new()).unwrap();
        assert_eq!(fw.id(), Some("disk"));
    }
}

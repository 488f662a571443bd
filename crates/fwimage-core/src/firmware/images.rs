//! Child image management and lookup

use super::{Firmware, FirmwareBase, FirmwareFormat, NodeId};
use crate::checksum::ChecksumKind;
use crate::error::{Error, Result};
use crate::flags::FirmwareFlags;
use crate::stream::ByteStream;
use crate::util::glob_match;

/// Deepest nesting level allowed for an image
pub const DEPTH_MAX: u32 = 50;

fn subtree_height(fw: &Firmware) -> u32 {
    fw.base
        .images
        .iter()
        .map(|img| 1 + subtree_height(img))
        .max()
        .unwrap_or(0)
}

fn rebase_depth(fw: &mut Firmware, depth: u32) {
    fw.base.depth = depth;
    for img in &mut fw.base.images {
        rebase_depth(img, depth + 1);
    }
}

fn detach(mut fw: Firmware) -> Firmware {
    fw.base.parent = None;
    rebase_depth(&mut fw, 0);
    fw
}

fn id_matches(pattern: &str, id: Option<&str>) -> bool {
    let Some(id) = id else {
        return false;
    };
    if pattern.contains(['*', '?']) {
        glob_match(pattern, id)
    } else {
        pattern == id
    }
}

impl FirmwareBase {
    /// Add a child image
    ///
    /// With [`FirmwareFlags::DEDUPE_ID`] or [`FirmwareFlags::DEDUPE_IDX`]
    /// set, an existing image with the same id or index is removed first.
    /// Fails if the image subtree would nest deeper than [`DEPTH_MAX`] or
    /// the image limit is reached.
    pub fn add_image(&mut self, mut image: Firmware) -> Result<&mut Firmware> {
        let depth = self.depth + 1;
        if depth + subtree_height(&image) > DEPTH_MAX {
            return Err(Error::InvalidData(format!(
                "images are nested too deep, limit is {}",
                DEPTH_MAX
            )));
        }

        if self.flags.contains(FirmwareFlags::DEDUPE_ID) {
            if let Some(pos) = self.images.iter().position(|img| img.id() == image.id()) {
                log::debug!("replacing image with id {:?}", image.id());
                detach(self.images.remove(pos));
            }
        }
        if self.flags.contains(FirmwareFlags::DEDUPE_IDX) {
            if let Some(pos) = self.images.iter().position(|img| img.idx() == image.idx()) {
                log::debug!("replacing image with idx 0x{:x}", image.idx());
                detach(self.images.remove(pos));
            }
        }

        if self.images_max > 0 && self.images.len() >= self.images_max {
            return Err(Error::InvalidData(format!(
                "too many images, limit is {}",
                self.images_max
            )));
        }

        image.base.parent = Some(self.node_id);
        rebase_depth(&mut image, depth);
        self.images.push(image);
        let last = self.images.len() - 1;
        Ok(&mut self.images[last])
    }

    /// Child images in insertion order
    pub fn images(&self) -> &[Firmware] {
        &self.images
    }

    /// Mutable iterator over child images
    pub fn images_mut(&mut self) -> std::slice::IterMut<'_, Firmware> {
        self.images.iter_mut()
    }

    /// Remove a child by node identity, returning it detached
    pub fn remove_image(&mut self, node_id: NodeId) -> Result<Firmware> {
        let pos = self
            .images
            .iter()
            .position(|img| img.node_id() == node_id)
            .ok_or_else(|| Error::NotFound(format!("image {:?} not found in firmware", node_id)))?;
        Ok(detach(self.images.remove(pos)))
    }

    /// Remove the first child with an exact id, returning it detached
    pub fn remove_image_by_id(&mut self, id: &str) -> Result<Firmware> {
        let pos = self
            .images
            .iter()
            .position(|img| img.id() == Some(id))
            .ok_or_else(|| Error::NotFound(format!("image id {} not found in firmware", id)))?;
        Ok(detach(self.images.remove(pos)))
    }

    /// Remove the first child with an index, returning it detached
    pub fn remove_image_by_idx(&mut self, idx: u64) -> Result<Firmware> {
        let pos = self
            .images
            .iter()
            .position(|img| img.idx() == idx)
            .ok_or_else(|| Error::NotFound(format!("image idx 0x{:x} not found in firmware", idx)))?;
        Ok(detach(self.images.remove(pos)))
    }

    fn position_by_id(&self, id: &str) -> Result<usize> {
        for alternative in id.split('|') {
            if let Some(pos) = self.images.iter().position(|img| id_matches(alternative, img.id())) {
                return Ok(pos);
            }
        }
        Err(Error::NotFound(format!("no image id {} found in firmware", id)))
    }

    /// Child with an id
    ///
    /// `id` may list alternatives separated by `|` and each may be a glob
    /// pattern using `*` and `?`. The first alternative that matches wins.
    pub fn image_by_id(&self, id: &str) -> Result<&Firmware> {
        let pos = self.position_by_id(id)?;
        Ok(&self.images[pos])
    }

    /// Mutable child with an id, matched as in [`image_by_id`](Self::image_by_id)
    pub fn image_by_id_mut(&mut self, id: &str) -> Result<&mut Firmware> {
        let pos = self.position_by_id(id)?;
        Ok(&mut self.images[pos])
    }

    /// First child that has no id
    pub fn image_without_id(&self) -> Result<&Firmware> {
        self.images
            .iter()
            .find(|img| img.id().is_none())
            .ok_or_else(|| Error::NotFound("no image without an id found in firmware".into()))
    }

    /// Child with an index
    pub fn image_by_idx(&self, idx: u64) -> Result<&Firmware> {
        self.images
            .iter()
            .find(|img| img.idx() == idx)
            .ok_or_else(|| Error::NotFound(format!("no image idx 0x{:x} found in firmware", idx)))
    }

    /// Child whose digest matches a hex checksum
    ///
    /// The algorithm is guessed from the checksum length.
    pub fn image_by_checksum(&self, checksum: &str) -> Result<&Firmware> {
        let kind = ChecksumKind::guess(checksum)
            .ok_or_else(|| Error::InvalidData(format!("unknown checksum kind for {}", checksum)))?;
        for img in &self.images {
            if img.checksum(kind)?.eq_ignore_ascii_case(checksum) {
                return Ok(img);
            }
        }
        Err(Error::NotFound(format!("no image with checksum {} found in firmware", checksum)))
    }

    /// First child of a concrete format
    pub fn image_by_format<T: FirmwareFormat>(&self) -> Result<&Firmware> {
        self.images
            .iter()
            .find(|img| img.format_as::<T>().is_some())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no image of type {} found in firmware",
                    std::any::type_name::<T>()
                ))
            })
    }

    /// Written bytes of the child with an id
    pub fn image_by_id_bytes(&self, id: &str) -> Result<Vec<u8>> {
        self.image_by_id(id)?.write()
    }

    /// Payload stream of the child with an id
    pub fn image_by_id_stream(&self, id: &str) -> Result<ByteStream> {
        self.image_by_id(id)?.stream()
    }

    /// Written bytes of the child with an index
    pub fn image_by_idx_bytes(&self, idx: u64) -> Result<Vec<u8>> {
        self.image_by_idx(idx)?.write()
    }

    /// Payload stream of the child with an index
    pub fn image_by_idx_stream(&self, idx: u64) -> Result<ByteStream> {
        self.image_by_idx(idx)?.stream()
    }
}

impl Firmware {
    /// Find a node in this subtree by identity
    ///
    /// Combined with [`FirmwareBase::parent_id`] this resolves a node's
    /// parent from the root of its tree.
    pub fn find(&self, node_id: NodeId) -> Option<&Firmware> {
        if self.node_id() == node_id {
            return Some(self);
        }
        self.images().iter().find_map(|img| img.find(node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn named(id: &str, data: &[u8]) -> Firmware {
        let mut fw = Firmware::from_bytes(data.to_vec());
        fw.set_id(id);
        fw
    }

    #[test]
    fn test_depth_limit() {
        let mut root = Firmware::raw();
        let mut current: &mut Firmware = &mut root;
        for level in 1..=DEPTH_MAX {
            current = current.add_image(Firmware::raw()).unwrap();
            assert_eq!(current.depth(), level);
        }
        let err = current.add_image(Firmware::raw()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_depth_limit_prebuilt_subtree() {
        let mut chain = Firmware::raw();
        let mut current: &mut Firmware = &mut chain;
        for _ in 0..DEPTH_MAX {
            current = current.add_image(Firmware::raw()).unwrap();
        }
        let mut root = Firmware::raw();
        assert!(root.add_image(chain).is_err());
    }

    #[test]
    fn test_parent_links() {
        let mut root = Firmware::raw();
        let root_id = root.node_id();
        let child = root.add_image(named("a", b"x")).unwrap();
        assert_eq!(child.parent_id(), Some(root_id));
        let child_id = child.node_id();
        assert!(root.find(child_id).is_some());

        let detached = root.remove_image(child_id).unwrap();
        assert_eq!(detached.parent_id(), None);
        assert_eq!(detached.depth(), 0);
        assert!(root.images().is_empty());
    }

    #[test]
    fn test_dedupe_id() {
        let mut root = Firmware::raw();
        root.add_flag(FirmwareFlags::DEDUPE_ID);
        root.add_image(named("x", b"first")).unwrap();
        root.add_image(named("x", b"second")).unwrap();
        root.add_image(named("y", b"other")).unwrap();
        assert_eq!(root.images().len(), 2);
        assert_eq!(&*root.image_by_id("x").unwrap().bytes().unwrap(), b"second");
    }

    #[test]
    fn test_dedupe_idx() {
        let mut root = Firmware::raw();
        root.add_flag(FirmwareFlags::DEDUPE_IDX);
        for data in [b"one", b"two"] {
            let mut fw = Firmware::from_bytes(data.to_vec());
            fw.set_idx(7);
            root.add_image(fw).unwrap();
        }
        assert_eq!(root.images().len(), 1);
        assert_eq!(root.image_by_idx_bytes(7).unwrap(), b"two");
    }

    #[test]
    fn test_no_dedupe_by_default() {
        let mut root = Firmware::raw();
        root.add_image(named("x", b"1")).unwrap();
        root.add_image(named("x", b"2")).unwrap();
        assert_eq!(root.images().len(), 2);
    }

    #[test]
    fn test_images_max() {
        let mut root = Firmware::raw();
        root.set_images_max(1);
        root.add_image(named("a", b"1")).unwrap();
        let err = root.add_image(named("b", b"2")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("too many images"));
    }

    #[test]
    fn test_lookup_by_id() {
        let mut root = Firmware::raw();
        root.add_image(named("bios", b"b")).unwrap();
        root.add_image(named("me", b"m")).unwrap();
        root.add_image(Firmware::from_bytes(b"anon".to_vec())).unwrap();

        assert_eq!(root.image_by_id("me").unwrap().id(), Some("me"));
        assert_eq!(root.image_by_id("ec|me").unwrap().id(), Some("me"));
        assert_eq!(root.image_by_id("bi*").unwrap().id(), Some("bios"));
        assert_eq!(root.image_by_id("gbe").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(&*root.image_without_id().unwrap().bytes().unwrap(), b"anon");
        assert_eq!(root.image_by_id_bytes("bios").unwrap(), b"b");
        assert_eq!(root.image_by_id_stream("me").unwrap().to_vec().unwrap(), b"m");
    }

    #[test]
    fn test_lookup_by_checksum() {
        let mut root = Firmware::raw();
        root.add_image(named("a", b"hello")).unwrap();
        root.add_image(named("b", b"world")).unwrap();
        let checksum = ChecksumKind::Sha256.compute(b"world");
        assert_eq!(root.image_by_checksum(&checksum).unwrap().id(), Some("b"));
        assert_eq!(
            root.image_by_checksum(&ChecksumKind::Sha256.compute(b"nope"))
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
        assert!(root.image_by_checksum("abc").is_err());
    }

    #[test]
    fn test_remove_by_id_and_idx() {
        let mut root = Firmware::raw();
        root.add_image(named("a", b"1")).unwrap();
        let mut b = named("b", b"2");
        b.set_idx(3);
        root.add_image(b).unwrap();

        assert_eq!(root.remove_image_by_id("a").unwrap().id(), Some("a"));
        assert_eq!(root.remove_image_by_idx(3).unwrap().id(), Some("b"));
        assert_eq!(root.remove_image_by_id("a").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_image_by_format() {
        let mut root = Firmware::raw();
        root.add_image(named("a", b"1")).unwrap();
        assert!(root.image_by_format::<crate::firmware::RawFirmware>().is_ok());
    }
}

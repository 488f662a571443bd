//! The per-format hook interface

use std::any::Any;
use std::fmt;

use super::{Firmware, FirmwareBase};
use crate::checksum::ChecksumKind;
use crate::error::{Error, Result};
use crate::flags::{ExportFlags, ParseFlags};
use crate::manifest::ManifestNode;
use crate::stream::ByteStream;
use crate::version::{version_from_u32, version_from_u64};

/// Hooks a concrete firmware format supplies to the generic pipeline
///
/// Every hook has a default, so a format only overrides what it needs.
/// Hooks receive the node's [`FirmwareBase`] separately from `self`, which
/// holds only the format's own fields.
pub trait FirmwareFormat: fmt::Debug + Send + 'static {
    /// Registry name, also written as the `type` attribute on export
    fn type_name(&self) -> &'static str;

    /// Upcast for downcasting to the concrete format
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting to the concrete format
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Set up a freshly created node, e.g. its flags
    fn init(&self, _base: &mut FirmwareBase) {}

    /// Whether [`validate`](Self::validate) checks for a magic signature
    ///
    /// Only formats returning `true` take part in the magic search.
    fn has_validator(&self) -> bool {
        false
    }

    /// Check that the format starts at `offset` in `stream`
    fn validate(&self, _stream: &ByteStream, _offset: u64) -> Result<()> {
        Ok(())
    }

    /// Split the input into records before parsing
    fn tokenize(&mut self, _base: &mut FirmwareBase, _stream: &ByteStream, _flags: ParseFlags) -> Result<()> {
        Ok(())
    }

    /// Parse the bounded input into the node
    ///
    /// The default only checks the size against the node alignment.
    fn parse(&mut self, base: &mut FirmwareBase, stream: &ByteStream, _flags: ParseFlags) -> Result<()> {
        base.check_alignment(stream.size()?)
    }

    /// Serialize the node
    ///
    /// The default is the payload with patches applied.
    fn write(&self, base: &FirmwareBase) -> Result<Vec<u8>> {
        Ok(base.bytes_with_patches()?.to_vec())
    }

    /// Add format-specific fields to an exported element
    fn export(&self, _base: &FirmwareBase, _flags: ExportFlags, _node: &mut ManifestNode) {}

    /// Read format-specific fields from a manifest element
    fn build(&mut self, _base: &mut FirmwareBase, _node: &ManifestNode) -> Result<()> {
        Ok(())
    }

    /// Check whether `other` could replace this node
    fn check_compatible(&self, _base: &FirmwareBase, _other: &Firmware, _flags: ParseFlags) -> Result<()> {
        Ok(())
    }

    /// Render a raw version as a display string
    ///
    /// The default renders using the node's version format.
    fn convert_version(&self, base: &FirmwareBase, version_raw: u64) -> Option<String> {
        match u32::try_from(version_raw) {
            Ok(v) => version_from_u32(v, base.version_format()),
            Err(_) => version_from_u64(version_raw, base.version_format()),
        }
    }

    /// Digest stored in or computed by the format itself
    fn checksum(&self, _base: &FirmwareBase, kind: ChecksumKind) -> Result<String> {
        Err(Error::NotSupported(format!(
            "{} has no {} checksum of its own",
            self.type_name(),
            kind
        )))
    }
}

/// The generic format: a raw payload with no structure
#[derive(Debug, Default, Clone, Copy)]
pub struct RawFirmware;

impl RawFirmware {
    /// Registry name of the generic format
    pub const TYPE_NAME: &'static str = "firmware";
}

impl FirmwareFormat for RawFirmware {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

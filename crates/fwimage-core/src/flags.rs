//! Flag sets for firmware nodes, parsing and export

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Maximum alignment exponent accepted for a node
pub const ALIGNMENT_MAX: u8 = 0x1F;

bitflags! {
    /// Properties of a firmware node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FirmwareFlags: u64 {
        /// Adding an image replaces any image with the same id
        const DEDUPE_ID         = 1 << 0;
        /// Adding an image replaces any image with the same index
        const DEDUPE_IDX        = 1 << 1;
        /// Format carries an embedded checksum
        const HAS_CHECKSUM      = 1 << 2;
        /// Format carries a vendor and product id
        const HAS_VID_PID       = 1 << 3;
        /// Node has been through the parse pipeline
        const DONE_PARSE        = 1 << 4;
        /// Format stores its own size in a header
        const HAS_STORED_SIZE   = 1 << 5;
        /// Search for magic even when the caller disabled searching
        const ALWAYS_SEARCH     = 1 << 6;
        /// Format cannot be detected from the content alone
        const NO_AUTO_DETECTION = 1 << 7;
    }
}

const FIRMWARE_FLAG_NAMES: &[(FirmwareFlags, &str)] = &[
    (FirmwareFlags::DEDUPE_ID, "dedupe-id"),
    (FirmwareFlags::DEDUPE_IDX, "dedupe-idx"),
    (FirmwareFlags::HAS_CHECKSUM, "has-checksum"),
    (FirmwareFlags::HAS_VID_PID, "has-vid-pid"),
    (FirmwareFlags::DONE_PARSE, "done-parse"),
    (FirmwareFlags::HAS_STORED_SIZE, "has-stored-size"),
    (FirmwareFlags::ALWAYS_SEARCH, "always-search"),
    (FirmwareFlags::NO_AUTO_DETECTION, "no-auto-detection"),
];

impl FirmwareFlags {
    /// Render as a `|` separated list, e.g. `dedupe-id|has-checksum`
    pub fn to_flag_string(self) -> String {
        FIRMWARE_FLAG_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Parse a `|` separated list of flag names
    pub fn from_flag_string(s: &str) -> Result<Self> {
        let mut flags = Self::empty();
        for part in s.split('|').map(str::trim).filter(|p| !p.is_empty()) {
            let (flag, _) = FIRMWARE_FLAG_NAMES
                .iter()
                .find(|(_, name)| *name == part)
                .ok_or_else(|| Error::InvalidData(format!("{} is not a valid firmware flag", part)))?;
            flags |= *flag;
        }
        Ok(flags)
    }
}

bitflags! {
    /// Options for the parse pipeline
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParseFlags: u32 {
        /// Do not fail on embedded checksum mismatches
        const IGNORE_CHECKSUM = 1 << 6;
        /// Do not fail on vendor or product id mismatches
        const IGNORE_VID_PID  = 1 << 7;
        /// Only validate at the given offset
        const NO_SEARCH       = 1 << 8;
        /// Keep the bounded stream view as the node payload
        const CACHE_STREAM    = 1 << 10;
        /// Read the bounded stream into a buffer payload
        const CACHE_BLOB      = 1 << 11;
    }
}

bitflags! {
    /// Options for exporting a node tree
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExportFlags: u32 {
        /// Include computed properties such as depth
        const INCLUDE_DEBUG = 1 << 0;
        /// Render payloads as printable ASCII instead of base64
        const ASCII_DATA    = 1 << 1;
    }
}

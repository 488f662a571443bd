//! The parse pipeline
//!
//! `Unparsed -> Validating -> Tokenizing -> Parsing -> Done`, with `Failed`
//! reachable from every step. A node is marked as parsed before any format
//! hook runs so that a half-populated node can never be parsed again.

use std::path::Path;

use super::{Firmware, ParseState, Payload};
use crate::error::{Error, Result, ResultExt};
use crate::flags::{FirmwareFlags, ParseFlags};
use crate::stream::{Blob, ByteStream};
use crate::util::format_size;

/// Largest input that is scanned byte by byte for a format magic
pub const SEARCH_MAGIC_BUFSZ_MAX: u64 = 32 * 1024 * 1024;

impl Firmware {
    /// Parse `stream` from `offset` into this node
    ///
    /// A node can only be parsed once; a second call fails with
    /// `NotSupported` and leaves the node untouched.
    pub fn parse(&mut self, stream: &ByteStream, offset: u64, flags: ParseFlags) -> Result<()> {
        if self.base.flags.contains(FirmwareFlags::DONE_PARSE) {
            return Err(Error::NotSupported("firmware object cannot be reused".into()));
        }
        let res = self.parse_stages(stream, offset, flags);
        self.set_state(if res.is_ok() { ParseState::Done } else { ParseState::Failed });
        res
    }

    /// Parse an in-memory buffer from `offset`
    pub fn parse_bytes(&mut self, data: impl Into<Blob>, offset: u64, flags: ParseFlags) -> Result<()> {
        self.parse(&ByteStream::from_blob(data.into()), offset, flags)
    }

    /// Parse a file, reading it on demand
    pub fn parse_file(&mut self, path: impl AsRef<Path>, flags: ParseFlags) -> Result<()> {
        let path = path.as_ref();
        let stream = ByteStream::from_file(path)?;
        self.parse(&stream, 0, flags)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    fn set_state(&mut self, state: ParseState) {
        log::trace!("{}: {:?} -> {:?}", self.type_name(), self.base.state, state);
        self.base.state = state;
    }

    fn parse_stages(&mut self, stream: &ByteStream, offset: u64, flags: ParseFlags) -> Result<()> {
        let streamsz = stream.size()?;
        if streamsz <= offset {
            return Err(Error::NotSupported(format!(
                "stream size 0x{:x} is smaller than offset 0x{:x}",
                streamsz, offset
            )));
        }

        self.set_state(ParseState::Validating);
        let offset = self.validate_for_offset(stream, offset, flags)?;

        let remaining = streamsz - offset;
        if remaining == 0 {
            return Err(Error::NotSupported("invalid firmware as zero sized".into()));
        }
        if self.base.size_max > 0 && remaining > self.base.size_max {
            return Err(Error::InvalidFile(format!(
                "firmware is too large ({}, limit {})",
                format_size(remaining),
                format_size(self.base.size_max)
            )));
        }

        // anything past here may leave partial state behind
        self.base.flags.insert(FirmwareFlags::DONE_PARSE);

        let partial = stream
            .slice(offset, remaining)
            .context("failed to cut firmware")?;

        if flags.contains(ParseFlags::CACHE_BLOB) {
            let len = usize::try_from(remaining)
                .map_err(|_| Error::InvalidFile("firmware too large to cache".into()))?;
            self.base.set_bytes(partial.read_bytes(0, len)?);
        } else if flags.contains(ParseFlags::CACHE_STREAM) {
            self.base.payload = Payload::Stream {
                stream: partial.clone(),
                size: remaining,
            };
        }

        self.set_state(ParseState::Tokenizing);
        self.format.tokenize(&mut self.base, &partial, flags)?;

        self.set_state(ParseState::Parsing);
        self.format.parse(&mut self.base, &partial, flags)?;

        if matches!(self.base.payload, Payload::Empty) {
            self.base.payload = Payload::Stream {
                stream: partial,
                size: remaining,
            };
        }
        Ok(())
    }

    /// Find the offset the format starts at
    fn validate_for_offset(&mut self, stream: &ByteStream, offset: u64, flags: ParseFlags) -> Result<u64> {
        if !self.format.has_validator() {
            return Ok(offset);
        }

        if !self.base.flags.contains(FirmwareFlags::ALWAYS_SEARCH) && flags.contains(ParseFlags::NO_SEARCH) {
            self.format.validate(stream, offset)?;
            return Ok(offset);
        }

        let streamsz = stream.size()?;
        if streamsz > SEARCH_MAGIC_BUFSZ_MAX {
            self.format.validate(stream, offset).with_context(|| {
                format!(
                    "failed to search for magic as firmware size was 0x{:x} and limit was 0x{:x}",
                    streamsz, SEARCH_MAGIC_BUFSZ_MAX
                )
            })?;
            return Ok(offset);
        }

        let mem = stream.to_memory()?;
        for candidate in offset..streamsz {
            if self.format.validate(&mem, candidate).is_ok() {
                log::debug!("{}: found magic at 0x{:x}", self.type_name(), candidate);
                self.base.offset = candidate;
                return Ok(candidate);
            }
        }
        Err(Error::InvalidFile("did not find magic".into()))
    }
}

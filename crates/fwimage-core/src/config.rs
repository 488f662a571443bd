//! Probe settings loaded from TOML
//!
//! ```toml
//! [probe]
//! formats = ["fmap", "ifd"]
//! offset = 0x1000
//! no_search = false
//! ignore_checksum = true
//! cache = "blob"
//! size_max = "32 MiB"
//! ```
//!
//! Every key is optional. An empty or missing `formats` list tries every
//! format that supports auto-detection.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result, ResultExt};
use crate::flags::ParseFlags;
use crate::util::{parse_number, parse_size};

/// Which payload the parse pipeline keeps before the format hooks run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Keep nothing up front
    #[default]
    None,
    /// Copy the input into memory
    Blob,
    /// Keep a bounded view of the input
    Stream,
    /// Both requested; the in-memory copy wins
    Both,
}

/// Settings for [`FormatRegistry::probe_with_config`](crate::FormatRegistry::probe_with_config)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Format names to try, in order
    pub formats: Vec<String>,
    /// Offset into the input to start parsing at
    pub offset: u64,
    /// Only validate at `offset`
    pub no_search: bool,
    /// Accept inputs with bad checksums
    pub ignore_checksum: bool,
    /// Payload caching
    pub cache: CacheMode,
    /// Largest accepted input, zero for unlimited
    pub size_max: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlProbeFile {
    probe: Option<TomlProbe>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlProbe {
    #[serde(default)]
    formats: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_hex_u64")]
    offset: u64,
    #[serde(default)]
    no_search: bool,
    #[serde(default)]
    ignore_checksum: bool,
    #[serde(default)]
    cache: CacheMode,
    size_max: Option<HexOrStr>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HexOrStr {
    Int(u64),
    Str(String),
}

/// Deserialize a u64 that can be hex (0x...) or decimal
fn deserialize_hex_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match HexOrStr::deserialize(deserializer)? {
        HexOrStr::Int(n) => Ok(n),
        HexOrStr::Str(s) => parse_number(&s).map_err(serde::de::Error::custom),
    }
}

impl ProbeConfig {
    /// Parse flags implied by these settings
    pub fn parse_flags(&self) -> ParseFlags {
        let mut flags = ParseFlags::empty();
        flags.set(ParseFlags::NO_SEARCH, self.no_search);
        flags.set(ParseFlags::IGNORE_CHECKSUM, self.ignore_checksum);
        match self.cache {
            CacheMode::None => {}
            CacheMode::Blob => flags |= ParseFlags::CACHE_BLOB,
            CacheMode::Stream => flags |= ParseFlags::CACHE_STREAM,
            CacheMode::Both => flags |= ParseFlags::CACHE_BLOB | ParseFlags::CACHE_STREAM,
        }
        flags
    }

    /// Parse settings from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlProbeFile =
            toml::from_str(content).map_err(|e| Error::InvalidData(format!("invalid probe config: {}", e)))?;
        let probe = file.probe.unwrap_or_default();

        let size_max = match probe.size_max {
            None => 0,
            Some(HexOrStr::Int(n)) => n,
            Some(HexOrStr::Str(s)) => {
                parse_size(&s).map_err(|e| Error::InvalidData(format!("size_max: {}", e)))?
            }
        };

        Ok(Self {
            formats: probe.formats,
            offset: probe.offset,
            no_search: probe.no_search,
            ignore_checksum: probe.ignore_checksum,
            cache: probe.cache,
            size_max,
        })
    }

    /// Load settings from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("failed to load {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("failed to read {}", path.display()))
    }
}

//! fwimage-core - Generic firmware image container model
//!
//! A firmware image is a tree of [`Firmware`] nodes. Each node carries
//! generic metadata (id, index, version, addresses, alignment, size limits),
//! an optional payload, an optional list of [`Chunk`]s and child images. The
//! behavior that differs between container formats lives behind the
//! [`FirmwareFormat`] trait, whose hooks are driven by a fixed pipeline:
//!
//! - `parse`: locate the format in a [`ByteStream`], tokenize and populate
//! - `write`: serialize the tree back to bytes
//! - `export` / `build`: describe a tree as an XML manifest and rebuild it
//!
//! # Example
//!
//! ```
//! use fwimage_core::{ExportFlags, FormatRegistry};
//!
//! let registry = FormatRegistry::new();
//! let fw = registry
//!     .build_from_xml("<firmware><id>main</id><data>aGVsbG8=</data></firmware>")
//!     .unwrap();
//! assert_eq!(&*fw.bytes().unwrap(), b"hello");
//! assert!(fw.export_to_xml(ExportFlags::empty()).contains("<id>main</id>"));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod checksum;
pub mod chunk;
pub mod config;
pub mod error;
pub mod firmware;
pub mod flags;
pub mod manifest;
pub mod registry;
pub mod stream;
pub mod util;
pub mod version;

pub use checksum::ChecksumKind;
pub use chunk::Chunk;
pub use config::{CacheMode, ProbeConfig};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use firmware::{
    Firmware, FirmwareBase, FirmwareFormat, NodeId, ParseState, Patch, Payload, RawFirmware,
};
pub use flags::{ExportFlags, FirmwareFlags, ParseFlags};
pub use manifest::ManifestNode;
pub use registry::{probe_formats, FormatFactory, FormatRegistry};
pub use stream::{Blob, ByteSource, ByteStream};
pub use version::VersionFormat;

//! fwimage-formats - Concrete firmware formats for fwimage-core
//!
//! Each format implements [`FirmwareFormat`](fwimage_core::FirmwareFormat)
//! and is registered by name:
//!
//! - `fmap` - Chromebook flash map with one image per area
//! - `ifd` - Intel Flash Descriptor with one `ifd-region` image per region
//! - `ihex` - Intel HEX text records
//! - `acpi-table` - a single ACPI table with header checksum
//!
//! # Example
//!
//! ```
//! use fwimage_core::{ByteStream, ParseFlags};
//!
//! let registry = fwimage_formats::registry();
//! let stream = ByteStream::from_bytes(b":0100000041BE\n:00000001FF\n".to_vec());
//! let fw = registry.probe_auto(&stream, 0, ParseFlags::empty()).unwrap();
//! assert_eq!(fw.type_name(), "ihex");
//! assert_eq!(&*fw.bytes().unwrap(), b"A");
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod acpi;
pub mod fmap;
pub mod ifd;
pub mod ihex;

use fwimage_core::FormatRegistry;

pub use acpi::AcpiTable;
pub use fmap::FmapFirmware;
pub use ifd::{IfdFirmware, IfdRegion};
pub use ihex::IhexFirmware;

/// Register every format of this crate
pub fn register_all(registry: &mut FormatRegistry) {
    registry.register::<FmapFirmware>();
    registry.register::<IfdFirmware>();
    registry.register::<IfdRegion>();
    registry.register::<IhexFirmware>();
    registry.register::<AcpiTable>();
}

/// A registry with the generic format and every format of this crate
pub fn registry() -> FormatRegistry {
    let mut registry = FormatRegistry::new();
    register_all(&mut registry);
    registry
}

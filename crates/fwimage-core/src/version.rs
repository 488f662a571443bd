//! Version formats and raw version rendering

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// How a raw numeric version is rendered as a string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VersionFormat {
    /// Not set
    #[default]
    Unknown,
    /// Opaque string, no conversion
    Plain,
    /// Single decimal number
    Number,
    /// `AA.BB`
    Pair,
    /// `AA.BB.CCDD`
    Triplet,
    /// `AA.BB.CC.DD`
    Quad,
    /// Binary coded decimal
    Bcd,
    /// Intel ME
    IntelMe,
    /// Intel ME, alternate layout
    IntelMe2,
    /// Legacy Microsoft Surface
    SurfaceLegacy,
    /// Microsoft Surface
    Surface,
    /// Dell BIOS, low three bytes
    DellBios,
    /// Hexadecimal
    Hex,
    /// Dell BIOS, high three bytes
    DellBiosMsb,
    /// Intel CSME 19 and later
    IntelCsme19,
}

const VERSION_FORMAT_NAMES: &[(VersionFormat, &str)] = &[
    (VersionFormat::Unknown, "unknown"),
    (VersionFormat::Plain, "plain"),
    (VersionFormat::Number, "number"),
    (VersionFormat::Pair, "pair"),
    (VersionFormat::Triplet, "triplet"),
    (VersionFormat::Quad, "quad"),
    (VersionFormat::Bcd, "bcd"),
    (VersionFormat::IntelMe, "intel-me"),
    (VersionFormat::IntelMe2, "intel-me2"),
    (VersionFormat::SurfaceLegacy, "surface-legacy"),
    (VersionFormat::Surface, "surface"),
    (VersionFormat::DellBios, "dell-bios"),
    (VersionFormat::Hex, "hex"),
    (VersionFormat::DellBiosMsb, "dell-bios-msb"),
    (VersionFormat::IntelCsme19, "intel-csme19"),
];

impl VersionFormat {
    /// Manifest name of the format
    pub fn as_str(self) -> &'static str {
        VERSION_FORMAT_NAMES
            .iter()
            .find(|(f, _)| *f == self)
            .map_or("unknown", |(_, name)| name)
    }
}

impl fmt::Display for VersionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VERSION_FORMAT_NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(f, _)| *f)
            .ok_or_else(|| Error::InvalidData(format!("{} is not a valid version format", s)))
    }
}

fn bcd(val: u8) -> u32 {
    u32::from(val >> 4) * 10 + u32::from(val & 0x0f)
}

/// Render a 16 bit raw version
pub fn version_from_u16(val: u16, fmt: VersionFormat) -> Option<String> {
    match fmt {
        VersionFormat::Bcd => Some(format!("{}.{}", bcd((val >> 8) as u8), bcd(val as u8))),
        VersionFormat::Pair => Some(format!("{}.{}", val >> 8, val & 0xff)),
        VersionFormat::Number | VersionFormat::Plain => Some(val.to_string()),
        VersionFormat::Hex => Some(format!("0x{:04x}", val)),
        _ => None,
    }
}

/// Render a 32 bit raw version
pub fn version_from_u32(val: u32, fmt: VersionFormat) -> Option<String> {
    let s = match fmt {
        VersionFormat::Quad => format!(
            "{}.{}.{}.{}",
            (val >> 24) & 0xff,
            (val >> 16) & 0xff,
            (val >> 8) & 0xff,
            val & 0xff
        ),
        VersionFormat::Triplet => format!("{}.{}.{}", (val >> 24) & 0xff, (val >> 16) & 0xff, val & 0xffff),
        VersionFormat::Pair => format!("{}.{}", (val >> 16) & 0xffff, val & 0xffff),
        VersionFormat::Number | VersionFormat::Plain => val.to_string(),
        VersionFormat::Bcd => {
            let b = val.to_be_bytes();
            format!("{}.{}.{}.{}", bcd(b[0]), bcd(b[1]), bcd(b[2]), bcd(b[3]))
        }
        VersionFormat::IntelMe => format!(
            "{}.{}.{}.{}",
            ((val >> 29) & 0x07) + 0x0b,
            (val >> 24) & 0x1f,
            (val >> 16) & 0xff,
            val & 0xffff
        ),
        VersionFormat::IntelMe2 => format!(
            "{}.{}.{}.{}",
            (val >> 28) & 0x0f,
            (val >> 24) & 0x0f,
            (val >> 16) & 0xff,
            val & 0xffff
        ),
        VersionFormat::IntelCsme19 => format!(
            "{}.{}.{}.{}",
            ((val >> 29) & 0x07) + 0x13,
            (val >> 24) & 0x1f,
            (val >> 16) & 0xff,
            val & 0xffff
        ),
        VersionFormat::SurfaceLegacy => format!(
            "{}.{}.{}",
            (val >> 22) & 0x3ff,
            (val >> 10) & 0xfff,
            val & 0x3ff
        ),
        VersionFormat::Surface => format!("{}.{}.{}", (val >> 24) & 0xff, (val >> 8) & 0xffff, val & 0xff),
        VersionFormat::DellBios => format!("{}.{}.{}", (val >> 16) & 0xff, (val >> 8) & 0xff, val & 0xff),
        VersionFormat::DellBiosMsb => {
            format!("{}.{}.{}", (val >> 24) & 0xff, (val >> 16) & 0xff, (val >> 8) & 0xff)
        }
        VersionFormat::Hex => format!("0x{:08x}", val),
        VersionFormat::Unknown => return None,
    };
    Some(s)
}

/// Render a 64 bit raw version
pub fn version_from_u64(val: u64, fmt: VersionFormat) -> Option<String> {
    match fmt {
        VersionFormat::Quad => Some(format!(
            "{}.{}.{}.{}",
            (val >> 48) & 0xffff,
            (val >> 32) & 0xffff,
            (val >> 16) & 0xffff,
            val & 0xffff
        )),
        VersionFormat::Pair => Some(format!("{}.{}", val >> 32, val & 0xffff_ffff)),
        VersionFormat::Number | VersionFormat::Plain => Some(val.to_string()),
        VersionFormat::Hex => Some(format!("0x{:016x}", val)),
        _ => u32::try_from(val).ok().and_then(|v| version_from_u32(v, fmt)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names() {
        for (fmt, name) in VERSION_FORMAT_NAMES {
            assert_eq!(fmt.as_str(), *name);
            assert_eq!(name.parse::<VersionFormat>().unwrap(), *fmt);
        }
        assert!("quintuple".parse::<VersionFormat>().is_err());
    }

    #[test]
    fn test_u32() {
        assert_eq!(version_from_u32(0x0102_0003, VersionFormat::Triplet).unwrap(), "1.2.3");
        assert_eq!(version_from_u32(0x0102_0304, VersionFormat::Quad).unwrap(), "1.2.3.4");
        assert_eq!(version_from_u32(0x0001_0002, VersionFormat::Pair).unwrap(), "1.2");
        assert_eq!(version_from_u32(0x1234_5678, VersionFormat::Bcd).unwrap(), "12.34.56.78");
        assert_eq!(version_from_u32(0x0001_0203, VersionFormat::DellBios).unwrap(), "1.2.3");
        assert_eq!(version_from_u32(0xff, VersionFormat::Hex).unwrap(), "0x000000ff");
        assert!(version_from_u32(1, VersionFormat::Unknown).is_none());
    }

    #[test]
    fn test_u16_and_u64() {
        assert_eq!(version_from_u16(0x0102, VersionFormat::Pair).unwrap(), "1.2");
        assert_eq!(version_from_u16(0x1203, VersionFormat::Bcd).unwrap(), "12.3");
        assert!(version_from_u16(1, VersionFormat::Triplet).is_none());
        assert_eq!(
            version_from_u64(0x0001_0002_0003_0004, VersionFormat::Quad).unwrap(),
            "1.2.3.4"
        );
        assert_eq!(version_from_u64(0x0102_0003, VersionFormat::Triplet).unwrap(), "1.2.3");
    }
}

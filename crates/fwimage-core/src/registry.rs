//! Format registry and probe chain
//!
//! Formats are registered by name with a factory function. The registry
//! resolves `type` attributes for the builder and tries candidate formats
//! against an input in order, keeping every rejection reason.

use crate::config::ProbeConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::firmware::{Firmware, FirmwareFormat, RawFirmware};
use crate::flags::{FirmwareFlags, ParseFlags};
use crate::manifest::xml;
use crate::stream::ByteStream;

/// Creates an empty node of one format
pub type FormatFactory = fn() -> Firmware;

fn create<T: FirmwareFormat + Default>() -> Firmware {
    Firmware::new(T::default())
}

/// Name to format mapping
#[derive(Debug, Clone)]
pub struct FormatRegistry {
    entries: Vec<(&'static str, FormatFactory)>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatRegistry {
    /// Registry holding only the generic `firmware` format
    pub fn new() -> Self {
        let mut registry = Self {
            entries: Vec::new(),
        };
        registry.register::<RawFirmware>();
        registry
    }

    /// Register a format under its type name
    pub fn register<T: FirmwareFormat + Default>(&mut self) {
        let name = T::default().type_name();
        self.register_factory(name, create::<T>);
    }

    /// Register a factory under a name, replacing any previous entry
    pub fn register_factory(&mut self, name: &'static str, factory: FormatFactory) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((name, factory)),
        }
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }

    fn factory(&self, name: &str) -> Result<FormatFactory> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, factory)| *factory)
            .ok_or_else(|| Error::NotFound(format!("format {} not registered", name)))
    }

    /// Create an empty node of a registered format
    pub fn create(&self, name: &str) -> Result<Firmware> {
        let factory = self.factory(name)?;
        Ok(factory())
    }

    /// Build a tree from XML, creating the root from its `type` attribute
    pub fn build_from_xml(&self, xml_text: &str) -> Result<Firmware> {
        let root = xml::from_xml(xml_text)?;
        let mut fw = match root.attr("type") {
            Some(name) => self.create(name)?,
            None => Firmware::raw(),
        };
        fw.build_root(&root, self)?;
        Ok(fw)
    }

    fn auto_factories(&self) -> Vec<FormatFactory> {
        self.entries
            .iter()
            .filter(|(name, _)| *name != RawFirmware::TYPE_NAME)
            .map(|(_, factory)| *factory)
            .filter(|factory| !factory().has_flag(FirmwareFlags::NO_AUTO_DETECTION))
            .collect()
    }

    /// Try the named formats in order, returning the first that parses
    pub fn probe(&self, stream: &ByteStream, offset: u64, flags: ParseFlags, names: &[&str]) -> Result<Firmware> {
        let factories = names
            .iter()
            .map(|name| self.factory(name))
            .collect::<Result<Vec<_>>>()?;
        probe_formats(stream, offset, flags, &factories)
    }

    /// Try every format that can be recognized from content alone
    ///
    /// The generic format and formats flagged
    /// [`FirmwareFlags::NO_AUTO_DETECTION`] are skipped.
    pub fn probe_auto(&self, stream: &ByteStream, offset: u64, flags: ParseFlags) -> Result<Firmware> {
        probe_formats(stream, offset, flags, &self.auto_factories())
    }

    /// Probe using the settings of a [`ProbeConfig`]
    ///
    /// An empty format list falls back to [`probe_auto`](Self::probe_auto).
    pub fn probe_with_config(&self, stream: &ByteStream, config: &ProbeConfig) -> Result<Firmware> {
        let factories: Vec<FormatFactory> = if config.formats.is_empty() {
            self.auto_factories()
        } else {
            config
                .formats
                .iter()
                .map(|name| self.factory(name))
                .collect::<Result<_>>()?
        };
        probe_candidates(
            stream,
            config.offset,
            config.parse_flags(),
            factories.iter().map(|factory| {
                let mut fw = factory();
                if config.size_max > 0 {
                    fw.set_size_max(config.size_max);
                }
                fw
            }),
        )
    }
}

/// Try each candidate format in order, returning the first that parses
///
/// If every candidate fails, the error carries each rejection reason and
/// the kind of the first failure.
pub fn probe_formats(stream: &ByteStream, offset: u64, flags: ParseFlags, candidates: &[FormatFactory]) -> Result<Firmware> {
    probe_candidates(stream, offset, flags, candidates.iter().map(|factory| factory()))
}

fn probe_candidates(
    stream: &ByteStream,
    offset: u64,
    flags: ParseFlags,
    candidates: impl Iterator<Item = Firmware>,
) -> Result<Firmware> {
    let mut first_kind: Option<ErrorKind> = None;
    let mut reasons = Vec::new();

    for mut fw in candidates {
        match fw.parse(stream, offset, flags) {
            Ok(()) => {
                log::debug!("probe: {} accepted input", fw.type_name());
                return Ok(fw);
            }
            Err(e) => {
                log::debug!("probe: {} rejected input: {}", fw.type_name(), e);
                first_kind.get_or_insert(e.kind());
                reasons.push(format!("{}: {}", fw.type_name(), e));
            }
        }
    }

    match first_kind {
        Some(kind) => Err(Error::new(kind, reasons.join("; "))),
        None => Err(Error::NothingToDo("no formats specified".into())),
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use super::*;
    use crate::firmware::FirmwareBase;

    macro_rules! prefix_format {
        ($name:ident, $type_name:literal, $magic:literal) => {
            #[derive(Debug, Default)]
            struct $name;

            impl FirmwareFormat for $name {
                fn type_name(&self) -> &'static str {
                    $type_name
                }

                fn as_any(&self) -> &dyn Any {
                    self
                }

                fn as_any_mut(&mut self) -> &mut dyn Any {
                    self
                }

                fn parse(&mut self, _base: &mut FirmwareBase, stream: &ByteStream, _flags: ParseFlags) -> Result<()> {
                    if stream.read_u8(0)? != $magic {
                        return Err(Error::InvalidFile(format!("{} magic missing", $type_name)));
                    }
                    Ok(())
                }
            }
        };
    }

    prefix_format!(Alpha, "alpha", b'A');
    prefix_format!(Bravo, "bravo", b'B');
    prefix_format!(Charlie, "charlie", b'C');

    fn registry() -> FormatRegistry {
        let mut registry = FormatRegistry::new();
        registry.register::<Alpha>();
        registry.register::<Bravo>();
        registry.register::<Charlie>();
        registry
    }

    #[test]
    fn test_probe_second_wins() {
        let stream = ByteStream::from_bytes(b"B-payload".to_vec());
        let fw = registry()
            .probe(&stream, 0, ParseFlags::empty(), &["alpha", "bravo", "charlie"])
            .unwrap();
        assert_eq!(fw.type_name(), "bravo");
        assert!(fw.format_as::<Bravo>().is_some());
    }

    #[test]
    fn test_probe_all_fail() {
        let stream = ByteStream::from_bytes(b"Z-payload".to_vec());
        let err = registry()
            .probe(&stream, 0, ParseFlags::empty(), &["alpha", "bravo", "charlie"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        let msg = err.to_string();
        assert!(msg.contains("alpha magic missing"));
        assert!(msg.contains("bravo magic missing"));
        assert!(msg.contains("charlie magic missing"));
    }

    #[test]
    fn test_probe_empty() {
        let stream = ByteStream::from_bytes(vec![0u8]);
        let err = probe_formats(&stream, 0, ParseFlags::empty(), &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NothingToDo);
    }

    #[test]
    fn test_probe_unknown_name() {
        let stream = ByteStream::from_bytes(vec![0u8]);
        let err = registry()
            .probe(&stream, 0, ParseFlags::empty(), &["delta"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_probe_auto_skips_raw() {
        let stream = ByteStream::from_bytes(b"C".to_vec());
        let fw = registry().probe_auto(&stream, 0, ParseFlags::empty()).unwrap();
        assert_eq!(fw.type_name(), "charlie");
    }

    #[test]
    fn test_create_and_names() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["firmware", "alpha", "bravo", "charlie"]);
        assert_eq!(registry.create("alpha").unwrap().type_name(), "alpha");
        assert_eq!(registry.create("zulu").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_build_from_xml_typed_root() {
        let fw = registry()
            .build_from_xml(r#"<firmware type="bravo"><id>b</id></firmware>"#)
            .unwrap();
        assert_eq!(fw.type_name(), "bravo");
        assert_eq!(fw.id(), Some("b"));
    }

    #[test]
    fn test_build_from_xml_bad_root() {
        let err = registry()
            .build_from_xml(r#"<image type="bravo"><id>b</id></image>"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("expected <firmware> root element"));
    }
}

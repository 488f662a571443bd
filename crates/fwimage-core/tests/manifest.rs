//! End-to-end checks of the manifest builder, export and probe settings

use fwimage_core::{
    ErrorKind, ExportFlags, Firmware, FormatRegistry, ManifestNode, ParseFlags, ProbeConfig,
    VersionFormat,
};

const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<firmware>
  <version>1.2.3</version>
  <version_format>triplet</version_format>
  <firmware>
    <id>a</id>
    <data>aGVsbG8=</data>
  </firmware>
  <firmware>
    <id>b</id>
    <data/>
  </firmware>
</firmware>
"#;

fn child<'a>(node: &'a ManifestNode, id: &str) -> &'a ManifestNode {
    node.children_named("firmware")
        .find(|c| c.text_of("id") == Some(id))
        .unwrap()
}

#[test]
fn test_build_then_export() {
    let _ = env_logger::builder().is_test(true).try_init();

    let registry = FormatRegistry::new();
    let fw = registry.build_from_xml(MANIFEST).unwrap();
    assert_eq!(fw.version(), Some("1.2.3"));
    assert_eq!(fw.version_format(), VersionFormat::Triplet);
    assert_eq!(fw.images().len(), 2);
    assert_eq!(&*fw.image_by_id("a").unwrap().bytes().unwrap(), b"hello");
    assert!(fw.image_by_id("b").unwrap().bytes().unwrap().is_empty());

    let node = fw.export(ExportFlags::empty());
    assert_eq!(node.text_of("version"), Some("1.2.3"));
    assert_eq!(node.text_of("version_format"), Some("triplet"));
    assert_eq!(child(&node, "a").text_of("data"), Some("aGVsbG8="));
    let empty = child(&node, "b").child("data").unwrap();
    assert_eq!(empty.text(), None);
}

#[test]
fn test_export_rebuilds_same_tree() {
    let registry = FormatRegistry::new();
    let fw = registry.build_from_xml(MANIFEST).unwrap();
    let xml = fw.export_to_xml(ExportFlags::empty());

    let rebuilt = registry.build_from_xml(&xml).unwrap();
    assert_eq!(rebuilt.export_to_xml(ExportFlags::empty()), xml);
    assert_eq!(rebuilt.write().unwrap(), fw.write().unwrap());
}

#[test]
fn test_write_file_and_parse_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("image.bin");

    let fw = Firmware::from_bytes(b"payload bytes".to_vec());
    fw.write_file(&path).unwrap();

    let mut parsed = Firmware::raw();
    parsed.parse_file(&path, ParseFlags::CACHE_BLOB).unwrap();
    assert_eq!(&*parsed.bytes().unwrap(), b"payload bytes");
}

#[test]
fn test_probe_config_without_formats() {
    let registry = FormatRegistry::new();
    let config = ProbeConfig::from_toml_str("[probe]\n").unwrap();
    let stream = fwimage_core::ByteStream::from_bytes(b"anything".to_vec());
    let err = registry.probe_with_config(&stream, &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NothingToDo);
}

#[test]
fn test_probe_config_named_generic() {
    let registry = FormatRegistry::new();
    let config = ProbeConfig::from_toml_str(
        "[probe]\nformats = [\"firmware\"]\noffset = 2\ncache = \"blob\"\nsize_max = 16\n",
    )
    .unwrap();
    let stream = fwimage_core::ByteStream::from_bytes(b"xxpayload".to_vec());
    let fw = registry.probe_with_config(&stream, &config).unwrap();
    assert_eq!(&*fw.bytes().unwrap(), b"payload");
    assert_eq!(fw.size_max(), 16);

    let big = fwimage_core::ByteStream::from_bytes(vec![0u8; 64]);
    let err = registry.probe_with_config(&big, &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFile);
}

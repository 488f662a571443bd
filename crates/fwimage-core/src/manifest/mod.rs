//! Declarative manifest trees
//!
//! A manifest is a tree of named elements carrying optional text and
//! attributes. The builder reads one to populate a firmware tree and the
//! exporter produces one from it. [`xml`] converts manifests to and from
//! XML documents such as:
//!
//! ```xml
//! <firmware type="fmap">
//!   <version>1.2.3</version>
//!   <firmware>
//!     <id>RO_SECTION</id>
//!     <data>aGVsbG8=</data>
//!   </firmware>
//! </firmware>
//! ```

pub mod xml;

use crate::error::{Error, Result};
use crate::util::parse_number;

/// One element of a manifest tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestNode {
    name: String,
    text: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<ManifestNode>,
}

impl ManifestNode {
    /// Create an empty element
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create an element holding text
    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut node = Self::new(name);
        node.text = Some(text.into());
        node
    }

    /// Element name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element text, if any
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Replace the element text
    pub fn set_text(&mut self, text: Option<String>) {
        self.text = text;
    }

    /// Look up an attribute
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All attributes in insertion order
    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }

    /// Set an attribute, replacing any previous value
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    /// Child elements in document order
    pub fn children(&self) -> &[ManifestNode] {
        &self.children
    }

    /// Append a child element, returning it for further population
    pub fn add_child(&mut self, child: ManifestNode) -> &mut ManifestNode {
        self.children.push(child);
        let idx = self.children.len() - 1;
        &mut self.children[idx]
    }

    /// First child with the given name
    pub fn child(&self, name: &str) -> Option<&ManifestNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ManifestNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First element matching a `/` separated path such as `chunks/chunk`
    pub fn query(&self, path: &str) -> Option<&ManifestNode> {
        path.split('/')
            .try_fold(self, |node, part| node.child(part))
    }

    /// Every element matching a `/` separated path
    pub fn query_all<'a>(&'a self, path: &str) -> Vec<&'a ManifestNode> {
        let mut current = vec![self];
        for part in path.split('/') {
            current = current
                .into_iter()
                .flat_map(|n| n.children.iter().filter(|c| c.name == part))
                .collect();
        }
        current
    }

    /// Text of the first child with the given name
    pub fn text_of(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(ManifestNode::text)
    }

    /// Number held by the named child, hex (`0x`) or decimal
    ///
    /// A missing child or the all-ones sentinel both read as `None`.
    pub fn uint_of(&self, name: &str) -> Result<Option<u64>> {
        let Some(text) = self.text_of(name) else {
            return Ok(None);
        };
        let value = parse_number(text)
            .map_err(|e| Error::InvalidData(format!("{} value {} is not a number: {}", name, text, e)))?;
        Ok((value != u64::MAX).then_some(value))
    }

    /// Append `<name>value</name>` unless the value is missing or empty
    pub fn insert_kv(&mut self, name: &str, value: Option<&str>) {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.children.push(Self::with_text(name, value));
        }
    }

    /// Append `<name>0x..</name>` unless the value is zero
    pub fn insert_kx(&mut self, name: &str, value: u64) {
        if value != 0 {
            self.children.push(Self::with_text(name, format!("0x{:x}", value)));
        }
    }

    /// Append `<name>true</name>` if the value is set
    pub fn insert_kb(&mut self, name: &str, value: bool) {
        if value {
            self.children.push(Self::with_text(name, "true"));
        }
    }

    /// Read a boolean child written by [`insert_kb`](Self::insert_kb)
    pub fn bool_of(&self, name: &str) -> Result<Option<bool>> {
        match self.text_of(name) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(other) => Err(Error::InvalidData(format!(
                "{} value {} is not a boolean",
                name, other
            ))),
        }
    }
}

//! XML reading and writing for manifest trees

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::ManifestNode;
use crate::error::{Error, Result};

/// Deepest element nesting accepted when reading
pub const NESTING_MAX: usize = 256;

fn node_from_start(e: &BytesStart<'_>) -> Result<ManifestNode> {
    let mut node = ManifestNode::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        node.set_attr(key, value);
    }
    Ok(node)
}

fn append_text(stack: &mut [ManifestNode], text: &str) {
    if let Some(top) = stack.last_mut() {
        let mut joined = top.text.take().unwrap_or_default();
        joined.push_str(text);
        top.text = Some(joined);
    }
}

/// Read a manifest from an XML document
///
/// The first top-level element becomes the returned root.
pub fn from_xml(xml: &str) -> Result<ManifestNode> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<ManifestNode> = Vec::new();
    let mut root: Option<ManifestNode> = None;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => {
                if stack.len() >= NESTING_MAX {
                    return Err(Error::InvalidData(format!(
                        "manifest nested too deep, limit is {}",
                        NESTING_MAX
                    )));
                }
                stack.push(node_from_start(e)?);
            }
            Event::Empty(ref e) => {
                let node = node_from_start(e)?;
                match stack.last_mut() {
                    Some(parent) => {
                        parent.add_child(node);
                    }
                    None => {
                        root.get_or_insert(node);
                    }
                }
            }
            Event::Text(e) => append_text(&mut stack, &e.unescape()?),
            Event::CData(e) => append_text(&mut stack, &String::from_utf8_lossy(&e.into_inner())),
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| Error::InvalidData("unbalanced end element".into()))?;
                match stack.last_mut() {
                    Some(parent) => {
                        parent.add_child(node);
                    }
                    None => {
                        root.get_or_insert(node);
                    }
                }
            }
            Event::Eof => break,
            // declarations, comments and processing instructions carry nothing
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Error::InvalidData(format!(
            "unexpected end of document inside <{}>",
            stack[stack.len() - 1].name()
        )));
    }
    root.ok_or_else(|| Error::InvalidData("no root element".into()))
}

fn write_node(out: &mut String, node: &ManifestNode, level: usize) {
    let indent = "  ".repeat(level);
    out.push_str(&indent);
    out.push('<');
    out.push_str(node.name());
    for (key, value) in node.attrs() {
        out.push_str(&format!(" {}=\"{}\"", key, escape(value)));
    }

    let text = node.text().filter(|t| !t.is_empty());
    match (text, node.children().is_empty()) {
        (None, true) => out.push_str("/>\n"),
        (Some(text), true) => {
            out.push_str(&format!(">{}</{}>\n", escape(text), node.name()));
        }
        (text, false) => {
            out.push_str(">\n");
            if let Some(text) = text {
                out.push_str(&format!("{}  {}\n", indent, escape(text)));
            }
            for child in node.children() {
                write_node(out, child, level + 1);
            }
            out.push_str(&format!("{}</{}>\n", indent, node.name()));
        }
    }
}

/// Render a manifest as an indented XML document
pub fn to_xml(node: &ManifestNode) -> String {
    let mut out = String::new();
    write_node(&mut out, node, 0);
    out
}

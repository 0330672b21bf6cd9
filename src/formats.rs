//! Metadata-format strategies and the per-record callback.
//!
//! A [`RecordParser`] turns the raw `<metadata>` fragment of a record into a
//! JSON payload. The parser is picked from the metadata prefix when a
//! session is built ([`parser_for`]); [`RecordCallback`] wraps it with the
//! session's deletion policy.
//!
//! | Prefix | Parser |
//! |--------|--------|
//! | `oai_dc` | [`DublinCoreParser`] |
//! | anything else (`igsn`, `datacite`, ...) | [`XmlTreeParser`] |

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::models::{HarvestContext, RawRecord};

/// Converts the metadata fragment of a live record into application fields.
///
/// Implementations must accept any well-formed fragment of their namespace
/// and report malformed input as [`HarvestError::Parse`].
pub trait RecordParser: Send + Sync {
    /// The metadata prefix this parser was selected for.
    fn metadata_prefix(&self) -> &str;

    fn parse(&self, record: &RawRecord) -> Result<Value>;
}

/// Select the parser for a metadata prefix.
pub fn parser_for(metadata_prefix: &str) -> Box<dyn RecordParser> {
    match metadata_prefix {
        "oai_dc" => Box::new(DublinCoreParser),
        other => Box::new(XmlTreeParser::new(other)),
    }
}

/// Generic parser: the whole fragment as a JSON tree.
///
/// Element names lose their namespace prefix, attributes become `@name`
/// keys, mixed text becomes `#text`, and repeated children become arrays.
/// Leaf elements without attributes collapse to their text.
pub struct XmlTreeParser {
    prefix: String,
}

impl XmlTreeParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl RecordParser for XmlTreeParser {
    fn metadata_prefix(&self) -> &str {
        &self.prefix
    }

    fn parse(&self, record: &RawRecord) -> Result<Value> {
        let fragment = metadata_of(record)?;
        xml_to_json(fragment).map_err(|e| HarvestError::parse(&record.header.identifier, e))
    }
}

/// Flattens simple Dublin Core into `{ "title": [..], "creator": [..] }`.
pub struct DublinCoreParser;

impl RecordParser for DublinCoreParser {
    fn metadata_prefix(&self) -> &str {
        "oai_dc"
    }

    fn parse(&self, record: &RawRecord) -> Result<Value> {
        let identifier = &record.header.identifier;
        let tree = xml_to_json(metadata_of(record)?)
            .map_err(|e| HarvestError::parse(identifier, e))?;

        let dc = match tree.get("dc") {
            Some(Value::Object(fields)) => fields.clone(),
            Some(Value::String(_)) => Map::new(),
            _ => return Err(HarvestError::parse(identifier, "no oai_dc:dc element")),
        };

        let mut out = Map::new();
        for (key, value) in dc {
            if key.starts_with('@') {
                continue;
            }
            let values = match value {
                Value::Array(items) => items.iter().filter_map(leaf_text).collect(),
                other => leaf_text(&other).into_iter().collect(),
            };
            out.insert(key, Value::Array(values));
        }
        Ok(Value::Object(out))
    }
}

fn leaf_text(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) if !s.is_empty() => Some(Value::String(s.clone())),
        Value::Object(obj) => obj.get("#text").cloned(),
        _ => None,
    }
}

fn metadata_of(record: &RawRecord) -> Result<&str> {
    record
        .metadata
        .as_deref()
        .ok_or_else(|| HarvestError::parse(&record.header.identifier, "record has no metadata"))
}

/// What the session should do with a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Live record with its decoded payload.
    Live(Value),
    /// Deleted record, passed through for the caller to handle.
    Deleted,
    /// Deleted record under a context that ignores deletions.
    Dropped,
}

/// The record callback: deletion policy plus the format parser.
pub struct RecordCallback {
    parser: Box<dyn RecordParser>,
    ignore_deleted: bool,
}

impl RecordCallback {
    pub fn new(parser: Box<dyn RecordParser>, ignore_deleted: bool) -> Self {
        Self {
            parser,
            ignore_deleted,
        }
    }

    pub fn for_context(ctx: &HarvestContext) -> Self {
        Self::new(parser_for(&ctx.metadata_prefix), ctx.ignore_deleted)
    }

    pub fn metadata_prefix(&self) -> &str {
        self.parser.metadata_prefix()
    }

    pub fn handle(&self, record: &RawRecord) -> Result<Disposition> {
        if record.header.deleted {
            if self.ignore_deleted {
                debug!(identifier = %record.header.identifier, "record deleted, ignoring");
                return Ok(Disposition::Dropped);
            }
            return Ok(Disposition::Deleted);
        }
        self.parser.parse(record).map(Disposition::Live)
    }
}

/// Element under construction while walking the fragment.
struct Node {
    name: String,
    attrs: Map<String, Value>,
    children: Vec<(String, Value)>,
    text: String,
}

impl Node {
    fn new(name: String) -> Self {
        Self {
            name,
            attrs: Map::new(),
            children: Vec::new(),
            text: String::new(),
        }
    }

    fn from_start(e: &BytesStart<'_>) -> std::result::Result<Self, String> {
        let mut node = Node::new(local(e.local_name().as_ref()));
        for attr in e.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let key = attr.key;
            if key.as_ref() == b"xmlns" || key.as_ref().starts_with(b"xmlns:") {
                continue;
            }
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            node.attrs.insert(
                format!("@{}", local(key.local_name().as_ref())),
                Value::String(value.into_owned()),
            );
        }
        Ok(node)
    }

    fn into_value(self) -> Value {
        let text = self.text.trim().to_string();
        if self.attrs.is_empty() && self.children.is_empty() {
            return Value::String(text);
        }
        let mut obj = self.attrs;
        for (key, value) in self.children {
            match obj.remove(&key) {
                None => {
                    obj.insert(key, value);
                }
                Some(Value::Array(mut items)) => {
                    items.push(value);
                    obj.insert(key, Value::Array(items));
                }
                Some(existing) => {
                    obj.insert(key, Value::Array(vec![existing, value]));
                }
            }
        }
        if !text.is_empty() {
            obj.insert("#text".to_string(), Value::String(text));
        }
        Value::Object(obj)
    }
}

fn local(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

/// Convert an XML fragment into a JSON object keyed by its top-level
/// element names.
pub fn xml_to_json(fragment: &str) -> std::result::Result<Value, String> {
    let mut reader = Reader::from_str(fragment);
    reader.config_mut().trim_text(true);

    let mut stack = vec![Node::new(String::new())];
    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(e) => stack.push(Node::from_start(&e)?),
            Event::Empty(e) => {
                let node = Node::from_start(&e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push((node.name.clone(), node.into_value()));
                }
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                if stack.len() < 2 {
                    return Err("unbalanced end tag".to_string());
                }
                if let Some(node) = stack.pop() {
                    let name = node.name.clone();
                    let value = node.into_value();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push((name, value));
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err("unclosed element in metadata".to_string());
    }
    let root = stack.pop().map(Node::into_value).unwrap_or(Value::Null);
    match root {
        Value::Object(_) => Ok(root),
        _ => Err("metadata contains no element".to_string()),
    }
}

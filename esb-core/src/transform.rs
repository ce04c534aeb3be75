//! Payload transformation between JSON, XML and CSV
//!
//! Every conversion pivots through a JSON document tree:
//!
//! - JSON -> XML: the document is wrapped in a root element; scalar fields
//!   become same-named elements, nested objects recurse, arrays become
//!   repeated elements, `null` becomes an empty element. Keys starting with
//!   `@` are written as attributes and `#text` as text content.
//! - XML -> JSON: the structural inverse. The root element is unwrapped,
//!   repeated siblings collapse into an array, attributes come back as `@name`
//!   keys and text is read back as typed scalars (booleans and numbers are
//!   recognised, an empty element is `null`).
//! - CSV: a single flat record, header row = keys, second row = values. An
//!   empty object is an empty CSV text.
//!
//! Strings whose text would read back as something else (`"42"`, `"true"`,
//! `""`, `" padded "`) carry a type hint so the round trip keeps them as
//! strings: an `esb-type="string"` attribute in XML, a `:string` header
//! suffix in CSV. Objects with no attributes or children (`{}`) are marked
//! `esb-type="object"`. The `esb-type` attribute is reserved.

use crate::{
    metrics,
    types::{MessageFormat, Payload},
    Error, Result,
};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Element name used for array items that have no field name of their own
const ARRAY_ITEM_ELEMENT: &str = "item";

/// Key carrying element text when the element also has attributes or children
const TEXT_KEY: &str = "#text";

/// Reserved attribute carrying type hints for the reader
const TYPE_HINT_ATTR: &str = "esb-type";

/// Hint: element text is a string, read verbatim
const STRING_HINT: &str = "string";

/// Hint: element is an object even without attributes or children
const OBJECT_HINT: &str = "object";

/// CSV header suffix marking a column whose value is a verbatim string
const CSV_STRING_SUFFIX: &str = ":string";

/// Snapshot of the transformation counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransformationMetrics {
    /// Transformations attempted
    pub total: u64,
    /// Transformations that produced a payload
    pub successful: u64,
    /// Transformations that failed
    pub failed: u64,
}

/// Message transformation engine
pub struct TransformationEngine {
    xml_root_element: String,
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
}

impl TransformationEngine {
    /// Create engine wrapping XML output in `xml_root_element`
    pub fn new(xml_root_element: impl Into<String>) -> Self {
        Self {
            xml_root_element: xml_root_element.into(),
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Convert `payload` from `source` to `target` format.
    ///
    /// Identical formats return the payload unchanged.
    pub fn transform(
        &self,
        payload: &Payload,
        source: MessageFormat,
        target: MessageFormat,
    ) -> Result<Payload> {
        let result = self.convert(payload, source, target);
        self.record(source.as_str(), target.as_str(), result.is_ok());

        match &result {
            Ok(_) => debug!("Transformed payload {} -> {}", source, target),
            Err(e) => warn!("{}", e),
        }
        result
    }

    /// Like [`transform`](Self::transform) but with format names as carried
    /// in message headers (`"JSON"`, `"XML"`, `"CSV"`)
    pub fn transform_str(&self, payload: &Payload, source: &str, target: &str) -> Result<Payload> {
        match (source.parse::<MessageFormat>(), target.parse::<MessageFormat>()) {
            (Ok(source), Ok(target)) => self.transform(payload, source, target),
            (Err(e), _) | (_, Err(e)) => {
                self.record(source, target, false);
                let err = Error::transformation(source, target, e.to_string());
                warn!("{}", err);
                Err(err)
            }
        }
    }

    /// Syntactic well-formedness check (no schema validation)
    pub fn validate_format(&self, payload: &Payload, format: MessageFormat) -> bool {
        match (format, payload) {
            (MessageFormat::Json, Payload::Document(_)) => true,
            (MessageFormat::Json, Payload::Text(text)) => {
                serde_json::from_str::<Value>(text).is_ok()
            }
            (MessageFormat::Xml, _) => text_of(payload).is_some_and(|t| xml_to_json(t).is_ok()),
            (MessageFormat::Csv, _) => text_of(payload).is_some_and(csv_is_well_formed),
        }
    }

    /// Counter snapshot
    pub fn metrics(&self) -> TransformationMetrics {
        TransformationMetrics {
            total: self.total.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Zero the counters
    pub fn reset_metrics(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }

    fn record(&self, source: &str, target: &str, success: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_transformation(source, target, success);
    }

    fn convert(
        &self,
        payload: &Payload,
        source: MessageFormat,
        target: MessageFormat,
    ) -> Result<Payload> {
        if source == target {
            return Ok(payload.clone());
        }

        let fail = |reason: String| Error::transformation(source, target, reason);

        let document = match source {
            MessageFormat::Json => match payload {
                Payload::Document(value) => value.clone(),
                Payload::Text(text) => {
                    serde_json::from_str(text).map_err(|e| fail(format!("malformed JSON: {}", e)))?
                }
            },
            MessageFormat::Xml => {
                let text = text_of(payload).ok_or_else(|| fail("expected XML text".to_string()))?;
                xml_to_json(text).map_err(fail)?
            }
            MessageFormat::Csv => {
                let text = text_of(payload).ok_or_else(|| fail("expected CSV text".to_string()))?;
                csv_to_json(text).map_err(fail)?
            }
        };

        match target {
            MessageFormat::Json => Ok(Payload::Document(document)),
            MessageFormat::Xml => json_to_xml(&document, &self.xml_root_element)
                .map(Payload::Text)
                .map_err(fail),
            MessageFormat::Csv => json_to_csv(&document).map(Payload::Text).map_err(fail),
        }
    }
}

impl Default for TransformationEngine {
    fn default() -> Self {
        Self::new(crate::DEFAULT_XML_ROOT_ELEMENT)
    }
}

/// Serialized text carried by a payload (a JSON string document counts)
fn text_of(payload: &Payload) -> Option<&str> {
    match payload {
        Payload::Text(text) => Some(text.as_str()),
        Payload::Document(Value::String(text)) => Some(text.as_str()),
        Payload::Document(_) => None,
    }
}

/// Text form of a scalar
fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Read text back as a typed scalar
fn infer_scalar(text: &str) -> Value {
    let text = text.trim();
    match text {
        "" => return Value::Null,
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }

    if looks_numeric(text) {
        if let Ok(n) = text.parse::<i64>() {
            return Value::from(n);
        }
        if let Ok(n) = text.parse::<u64>() {
            return Value::from(n);
        }
        if let Some(n) = text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
        {
            return Value::Number(n);
        }
    }
    Value::String(text.to_string())
}

/// True for strings that [`infer_scalar`] would not give back unchanged
fn needs_string_hint(value: &Value) -> bool {
    match value {
        Value::String(s) => infer_scalar(s).as_str() != Some(s.as_str()),
        _ => false,
    }
}

/// JSON number grammar start, without leading zeros ("007" stays a string)
fn looks_numeric(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let mut chars = digits.chars();
    match (chars.next(), chars.next()) {
        (Some('0'), Some(c)) => c == '.' || c == 'e' || c == 'E',
        (Some(c), _) => c.is_ascii_digit(),
        (None, _) => false,
    }
}

fn check_element_name(name: &str) -> std::result::Result<(), String> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_alphabetic() || first == '_')
                && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(format!("'{}' is not a valid XML element name", name))
    }
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn json_to_xml(value: &Value, root: &str) -> std::result::Result<String, String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_element(&mut writer, root, value)?;
    String::from_utf8(writer.into_inner().into_inner()).map_err(|e| e.to_string())
}

fn write_event(writer: &mut XmlWriter, event: Event<'_>) -> std::result::Result<(), String> {
    writer.write_event(event).map_err(|e| e.to_string())
}

fn write_element(
    writer: &mut XmlWriter,
    name: &str,
    value: &Value,
) -> std::result::Result<(), String> {
    check_element_name(name)?;

    match value {
        Value::Null => write_event(writer, Event::Empty(BytesStart::new(name))),
        Value::Object(map) => {
            let mut start = BytesStart::new(name);
            for (key, attr) in map {
                if let Some(attr_name) = key.strip_prefix('@') {
                    if attr.is_object() || attr.is_array() {
                        return Err(format!("attribute '{}' must be a scalar", attr_name));
                    }
                    if attr_name == TYPE_HINT_ATTR {
                        return Err(format!("attribute '{}' is reserved", attr_name));
                    }
                    check_element_name(attr_name)?;
                    start.push_attribute((attr_name, scalar_text(attr).as_str()));
                }
            }

            let mut hints = Vec::new();
            if map.keys().all(|key| key == TEXT_KEY) {
                hints.push(OBJECT_HINT);
            }
            if map.get(TEXT_KEY).is_some_and(needs_string_hint) {
                hints.push(STRING_HINT);
            }
            if !hints.is_empty() {
                start.push_attribute((TYPE_HINT_ATTR, hints.join(" ").as_str()));
            }
            write_event(writer, Event::Start(start))?;

            if let Some(text) = map.get(TEXT_KEY) {
                write_event(writer, Event::Text(BytesText::new(&scalar_text(text))))?;
            }
            for (key, child) in map {
                if key.starts_with('@') || key == TEXT_KEY {
                    continue;
                }
                write_field(writer, key, child)?;
            }

            write_event(writer, Event::End(BytesEnd::new(name)))
        }
        Value::Array(items) => {
            write_event(writer, Event::Start(BytesStart::new(name)))?;
            for item in items {
                write_element(writer, ARRAY_ITEM_ELEMENT, item)?;
            }
            write_event(writer, Event::End(BytesEnd::new(name)))
        }
        scalar => {
            let mut start = BytesStart::new(name);
            if needs_string_hint(scalar) {
                start.push_attribute((TYPE_HINT_ATTR, STRING_HINT));
            }
            write_event(writer, Event::Start(start))?;
            write_event(writer, Event::Text(BytesText::new(&scalar_text(scalar))))?;
            write_event(writer, Event::End(BytesEnd::new(name)))
        }
    }
}

/// Object field: arrays become repeated elements named after the field
fn write_field(writer: &mut XmlWriter, key: &str, value: &Value) -> std::result::Result<(), String> {
    match value {
        Value::Array(items) => {
            for item in items {
                write_element(writer, key, item)?;
            }
            Ok(())
        }
        other => write_element(writer, key, other),
    }
}

/// Element under construction while reading XML
struct XmlNode {
    name: String,
    fields: Map<String, Value>,
    text: String,
    /// Text is a verbatim string (`esb-type="string"`)
    verbatim_text: bool,
    /// Object even when empty (`esb-type="object"`)
    force_object: bool,
}

impl XmlNode {
    fn open(start: &BytesStart<'_>) -> std::result::Result<Self, String> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut fields = Map::new();
        let mut verbatim_text = false;
        let mut force_object = false;
        for attr in start.attributes() {
            let attr = attr.map_err(|e| format!("malformed attribute on <{}>: {}", name, e))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| format!("malformed attribute value on <{}>: {}", name, e))?;

            if key == TYPE_HINT_ATTR {
                for hint in value.split_whitespace() {
                    match hint {
                        STRING_HINT => verbatim_text = true,
                        OBJECT_HINT => force_object = true,
                        other => {
                            return Err(format!("unknown {} '{}' on <{}>", TYPE_HINT_ATTR, other, name))
                        }
                    }
                }
                continue;
            }
            fields.insert(format!("@{}", key), infer_scalar(&value));
        }
        Ok(Self {
            name,
            fields,
            text: String::new(),
            verbatim_text,
            force_object,
        })
    }

    fn finish(self) -> (String, Value) {
        let text = if self.verbatim_text {
            Some(Value::String(self.text))
        } else if self.text.trim().is_empty() {
            None
        } else {
            Some(infer_scalar(&self.text))
        };

        if self.fields.is_empty() && !self.force_object {
            return (self.name, text.unwrap_or(Value::Null));
        }
        let mut fields = self.fields;
        if let Some(text) = text {
            fields.insert(TEXT_KEY.to_string(), text);
        }
        (self.name, Value::Object(fields))
    }
}

fn insert_child(fields: &mut Map<String, Value>, name: String, value: Value) {
    match fields.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            fields.insert(name, value);
        }
    }
}

fn close_node(
    stack: &mut Vec<XmlNode>,
    root: &mut Option<Value>,
    node: XmlNode,
) -> std::result::Result<(), String> {
    let (name, value) = node.finish();
    match stack.last_mut() {
        Some(parent) => insert_child(&mut parent.fields, name, value),
        None if root.is_some() => return Err("document has more than one root element".to_string()),
        None => *root = Some(value),
    }
    Ok(())
}

fn xml_to_json(text: &str) -> std::result::Result<Value, String> {
    // Text is kept untrimmed; whitespace-only text between elements is
    // dropped when the element closes
    let mut reader = Reader::from_str(text);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<Value> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("malformed XML at byte {}: {}", reader.buffer_position(), e))?;

        match event {
            Event::Start(start) => {
                if stack.is_empty() && root.is_some() {
                    return Err("document has more than one root element".to_string());
                }
                stack.push(XmlNode::open(&start)?);
            }
            Event::Empty(start) => {
                let node = XmlNode::open(&start)?;
                close_node(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| "closing tag without matching opening tag".to_string())?;
                close_node(&mut stack, &mut root, node)?;
            }
            Event::Text(t) => {
                let content = t.unescape().map_err(|e| format!("malformed text: {}", e))?;
                push_text(&mut stack, &content)?;
            }
            Event::CData(data) => {
                let content = String::from_utf8_lossy(&data).into_owned();
                push_text(&mut stack, &content)?;
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions, doctype
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(format!("unclosed element <{}>", open.name));
    }
    root.ok_or_else(|| "document has no root element".to_string())
}

fn push_text(stack: &mut [XmlNode], content: &str) -> std::result::Result<(), String> {
    match stack.last_mut() {
        Some(node) => {
            node.text.push_str(content);
            Ok(())
        }
        None if content.trim().is_empty() => Ok(()),
        None => Err("text outside the root element".to_string()),
    }
}

fn json_to_csv(value: &Value) -> std::result::Result<String, String> {
    let map = value
        .as_object()
        .ok_or_else(|| "CSV output requires a flat JSON object".to_string())?;
    if map.is_empty() {
        return Ok(String::new());
    }

    let mut headers = Vec::with_capacity(map.len());
    let mut values = Vec::with_capacity(map.len());
    for (key, field) in map {
        if field.is_object() || field.is_array() {
            return Err(format!(
                "field '{}' is nested; CSV output requires scalar values",
                key
            ));
        }

        // A key already ending in the suffix gets it twice so the reader
        // strips only one
        let header = if needs_string_hint(field) || key.ends_with(CSV_STRING_SUFFIX) {
            if !field.is_string() {
                return Err(format!(
                    "column '{}' ends with '{}' but its value is not a string",
                    key, CSV_STRING_SUFFIX
                ));
            }
            format!("{}{}", key, CSV_STRING_SUFFIX)
        } else {
            key.clone()
        };
        headers.push(header);
        values.push(scalar_text(field));
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&headers).map_err(|e| e.to_string())?;
    writer.write_record(&values).map_err(|e| e.to_string())?;
    let bytes = writer.into_inner().map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

fn csv_to_json(text: &str) -> std::result::Result<Value, String> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| format!("malformed CSV header: {}", e))?
        .clone();
    if headers.iter().all(str::is_empty) {
        return Err("CSV has no header row".to_string());
    }

    let mut records = reader.records();
    let record = records
        .next()
        .ok_or_else(|| "CSV has a header row but no value row".to_string())?
        .map_err(|e| format!("malformed CSV record: {}", e))?;
    if records.next().is_some() {
        return Err("multi-record CSV is not supported".to_string());
    }

    let mut fields = Map::new();
    for (header, value) in headers.iter().zip(record.iter()) {
        let (key, value) = match header.strip_suffix(CSV_STRING_SUFFIX) {
            Some(key) => (key, Value::String(value.to_string())),
            None => (header, infer_scalar(value)),
        };
        if fields.insert(key.to_string(), value).is_some() {
            return Err(format!("duplicate CSV column '{}'", key));
        }
    }
    Ok(Value::Object(fields))
}

fn csv_is_well_formed(text: &str) -> bool {
    if text.trim().is_empty() {
        return true;
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(text.as_bytes());

    let has_header = match reader.headers() {
        Ok(headers) => !headers.iter().all(str::is_empty),
        Err(_) => false,
    };
    has_header && reader.records().all(|record| record.is_ok())
}

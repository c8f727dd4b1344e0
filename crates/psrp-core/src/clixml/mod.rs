//! CLIXML codec
//!
//! Bidirectional serialization between [`PsValue`] and the CLIXML dialect
//! defined by MS-PSRP 2.2.5. Encoding is deterministic; decoding accepts
//! anything PowerShell 2.0+ produces, skipping unknown elements under
//! `<Obj>` rather than failing.
//!
//! Each codec instance carries two per-document tables: object references
//! (`<Ref RefId>` back-edges for repeated complex objects, keyed by `Rc`
//! identity) and type-name references (`<TNRef RefId>` for repeated type
//! lists, keyed by the leading type name). Collection objects always
//! serialize inline: PowerShell's deserializer has historically
//! mis-handled back-references into collection types.

pub mod escape;
pub mod text;

use std::collections::HashMap;
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::crypto::CryptoProvider;
use crate::errors::{PsrpError, Result, SerializationError};
use crate::registry::{TypeRegistry, TypeShape};
use crate::types::PsVersion;
use crate::value::{Container, PsEnum, PsObject, PsSecureString, PsValue};

use escape::{escape_str, escape_string, unescape_str, unescape_string};

// ----------------------------------------------------------------------------
// Entry points
// ----------------------------------------------------------------------------

/// Serialize a value to CLIXML text. SecureStrings fail with
/// `CryptoUnavailable`; use [`serialize_clixml_with`] once a session key
/// has been exchanged.
pub fn serialize_clixml(value: &PsValue) -> Result<String> {
    Serializer::new().serialize(value)
}

/// Serialize a value to CLIXML text, encrypting SecureStrings through the
/// given provider.
pub fn serialize_clixml_with(value: &PsValue, crypto: &dyn CryptoProvider) -> Result<String> {
    Serializer::with_crypto(crypto).serialize(value)
}

/// Deserialize CLIXML text. Multiple top-level elements (no envelope)
/// yield multiple values. Uses the standard type registry.
pub fn deserialize_clixml(text: &str) -> Result<Vec<PsValue>> {
    let registry = TypeRegistry::standard();
    Deserializer::new(&registry).deserialize(text)
}

/// Deserialize CLIXML text against a caller-supplied registry.
pub fn deserialize_clixml_with(text: &str, registry: &TypeRegistry) -> Result<Vec<PsValue>> {
    Deserializer::new(registry).deserialize(text)
}

// ----------------------------------------------------------------------------
// Serializer
// ----------------------------------------------------------------------------

/// A single-document CLIXML encoder. Instances must not be reused across
/// documents: the reference tables are per-document state.
pub struct Serializer<'a> {
    crypto: Option<&'a dyn CryptoProvider>,
    obj_refs: HashMap<usize, u64>,
    next_obj_ref: u64,
    tn_refs: HashMap<String, u64>,
    next_tn_ref: u64,
}

impl<'a> Serializer<'a> {
    pub fn new() -> Self {
        Self {
            crypto: None,
            obj_refs: HashMap::new(),
            next_obj_ref: 0,
            tn_refs: HashMap::new(),
            next_tn_ref: 0,
        }
    }

    pub fn with_crypto(crypto: &'a dyn CryptoProvider) -> Self {
        Self {
            crypto: Some(crypto),
            ..Self::new()
        }
    }

    /// Serialize one top-level value.
    pub fn serialize(&mut self, value: &PsValue) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        self.write_value(&mut writer, value, None)?;
        String::from_utf8(writer.into_inner())
            .map_err(|e| SerializationError::malformed(e.to_string()).into())
    }

    fn write_value<W: std::io::Write>(
        &mut self,
        writer: &mut Writer<W>,
        value: &PsValue,
        name: Option<&str>,
    ) -> Result<()> {
        match value {
            PsValue::Null => write_empty(writer, "Nil", name),
            PsValue::Bool(b) => write_text(writer, "B", if *b { "true" } else { "false" }, name),
            PsValue::String(s) => write_text(writer, "S", &escape_string(s), name),
            PsValue::Char(c) => write_text(writer, "C", &c.to_string(), name),
            PsValue::SByte(v) => write_text(writer, "SB", &v.to_string(), name),
            PsValue::Byte(v) => write_text(writer, "By", &v.to_string(), name),
            PsValue::Int16(v) => write_text(writer, "I16", &v.to_string(), name),
            PsValue::UInt16(v) => write_text(writer, "U16", &v.to_string(), name),
            PsValue::Int32(v) => write_text(writer, "I32", &v.to_string(), name),
            PsValue::UInt32(v) => write_text(writer, "U32", &v.to_string(), name),
            PsValue::Int64(v) => write_text(writer, "I64", &v.to_string(), name),
            PsValue::UInt64(v) => write_text(writer, "U64", &v.to_string(), name),
            PsValue::Single(v) => write_text(writer, "Sg", &text::format_f32(*v), name),
            PsValue::Double(v) => write_text(writer, "Db", &text::format_f64(*v), name),
            PsValue::Decimal(v) => write_text(writer, "D", &v.to_string(), name),
            PsValue::DateTime(v) => write_text(writer, "DT", &text::format_datetime(v), name),
            PsValue::Duration(v) => write_text(writer, "TS", &text::format_duration(*v), name),
            PsValue::ByteArray(v) => write_text(writer, "BA", &BASE64.encode(v), name),
            PsValue::Guid(v) => write_text(writer, "G", &v.to_string(), name),
            PsValue::Uri(v) => write_text(writer, "URI", &escape_str(v), name),
            PsValue::Version(v) => write_text(writer, "Version", &v.to_string(), name),
            PsValue::XmlDocument(v) => write_text(writer, "XD", &escape_str(v), name),
            PsValue::ScriptBlock(v) => write_text(writer, "SBK", &escape_str(v), name),
            PsValue::SecureString(ss) => {
                let encoded = match ss {
                    PsSecureString::Plaintext(plain) => self
                        .crypto
                        .ok_or(SerializationError::CryptoUnavailable)?
                        .encrypt(plain)?,
                    PsSecureString::Encrypted(cipher) => cipher.clone(),
                };
                write_text(writer, "SS", &encoded, name)
            }
            PsValue::Object(obj) => self.write_object(writer, obj, name),
            PsValue::Enum(e) => self.write_enum(writer, e, name),
        }
    }

    fn write_object<W: std::io::Write>(
        &mut self,
        writer: &mut Writer<W>,
        obj: &Rc<PsObject>,
        name: Option<&str>,
    ) -> Result<()> {
        let identity = Rc::as_ptr(obj) as usize;
        let is_container = obj.container.is_some();

        if !is_container {
            if let Some(ref_id) = self.obj_refs.get(&identity) {
                return write_empty_with_ref(writer, "Ref", *ref_id, name);
            }
        }

        let ref_id = self.next_obj_ref;
        self.next_obj_ref += 1;
        if !is_container {
            self.obj_refs.insert(identity, ref_id);
        }

        start_obj(writer, ref_id, name)?;

        if let Some(primitive) = &obj.primitive {
            self.write_value(writer, primitive, None)?;
        }

        let is_extended_primitive =
            obj.primitive.is_some() && (!obj.adapted.is_empty() || !obj.extended.is_empty());
        if !obj.type_names.is_empty() && !is_extended_primitive {
            self.write_type_names(writer, &obj.type_names)?;
        }

        if !obj.adapted.is_empty() {
            write_start(writer, "Props")?;
            for prop in obj.adapted.iter() {
                self.write_value(writer, &prop.value, Some(&prop.name))?;
            }
            write_end(writer, "Props")?;
        }
        if !obj.extended.is_empty() {
            write_start(writer, "MS")?;
            for prop in obj.extended.iter() {
                self.write_value(writer, &prop.value, Some(&prop.name))?;
            }
            write_end(writer, "MS")?;
        }

        match &obj.container {
            Some(Container::Dict(entries)) => {
                write_start(writer, "DCT")?;
                for (key, entry) in entries {
                    write_start(writer, "En")?;
                    self.write_value(writer, key, Some("Key"))?;
                    self.write_value(writer, entry, Some("Value"))?;
                    write_end(writer, "En")?;
                }
                write_end(writer, "DCT")?;
            }
            Some(container) => {
                let (tag, items) = match container {
                    Container::Stack(items) => ("STK", items),
                    Container::Queue(items) => ("QUE", items),
                    Container::List(items) => ("LST", items),
                    Container::Enumerable(items) => ("IE", items),
                    Container::Dict(_) => unreachable!(),
                };
                write_start(writer, tag)?;
                for item in items {
                    self.write_value(writer, item, None)?;
                }
                write_end(writer, tag)?;
            }
            None => {
                if !is_extended_primitive {
                    if let Some(to_string) = &obj.to_string {
                        write_text(writer, "ToString", &escape_str(to_string), None)?;
                    }
                }
            }
        }

        write_end(writer, "Obj")
    }

    fn write_enum<W: std::io::Write>(
        &mut self,
        writer: &mut Writer<W>,
        value: &Rc<PsEnum>,
        name: Option<&str>,
    ) -> Result<()> {
        let identity = Rc::as_ptr(value) as usize;
        if let Some(ref_id) = self.obj_refs.get(&identity) {
            return write_empty_with_ref(writer, "Ref", *ref_id, name);
        }
        let ref_id = self.next_obj_ref;
        self.next_obj_ref += 1;
        self.obj_refs.insert(identity, ref_id);

        start_obj(writer, ref_id, name)?;
        write_text(writer, value.tag.element(), &value.value.to_string(), None)?;
        if !value.type_names.is_empty() {
            self.write_type_names(writer, &value.type_names)?;
        }
        write_text(writer, "ToString", &escape_str(&value.label_string()), None)?;
        write_end(writer, "Obj")
    }

    fn write_type_names<W: std::io::Write>(
        &mut self,
        writer: &mut Writer<W>,
        type_names: &[String],
    ) -> Result<()> {
        let leading = &type_names[0];
        if let Some(ref_id) = self.tn_refs.get(leading) {
            return write_empty_with_ref(writer, "TNRef", *ref_id, None);
        }

        let ref_id = self.next_tn_ref;
        self.next_tn_ref += 1;
        self.tn_refs.insert(leading.clone(), ref_id);

        let mut start = BytesStart::new("TN");
        let id = ref_id.to_string();
        start.push_attribute(("RefId", id.as_str()));
        write_event(writer, Event::Start(start))?;
        for type_name in type_names {
            write_text(writer, "T", &escape_str(type_name), None)?;
        }
        write_end(writer, "TN")
    }
}

impl Default for Serializer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Low-level writer helpers
// ----------------------------------------------------------------------------

fn write_event<W: std::io::Write>(writer: &mut Writer<W>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| SerializationError::malformed(e.to_string()).into())
}

/// Build an element, attaching the escaped property name attribute when
/// present. `push_attribute` copies into the element's own buffer, so the
/// returned event owns all of its data.
fn element(tag: &str, name: Option<&str>) -> BytesStart<'static> {
    let mut start = BytesStart::new(tag.to_string());
    if let Some(name) = name {
        start.push_attribute(("N", escape_str(name).as_str()));
    }
    start
}

fn write_text<W: std::io::Write>(
    writer: &mut Writer<W>,
    tag: &str,
    content: &str,
    name: Option<&str>,
) -> Result<()> {
    let start = element(tag, name);
    if content.is_empty() {
        return write_event(writer, Event::Empty(start));
    }
    write_event(writer, Event::Start(start))?;
    write_event(writer, Event::Text(BytesText::new(content)))?;
    write_event(writer, Event::End(BytesEnd::new(tag.to_string())))
}

fn write_empty<W: std::io::Write>(
    writer: &mut Writer<W>,
    tag: &str,
    name: Option<&str>,
) -> Result<()> {
    write_event(writer, Event::Empty(element(tag, name)))
}

fn write_empty_with_ref<W: std::io::Write>(
    writer: &mut Writer<W>,
    tag: &str,
    ref_id: u64,
    name: Option<&str>,
) -> Result<()> {
    let mut start = element(tag, name);
    start.push_attribute(("RefId", ref_id.to_string().as_str()));
    write_event(writer, Event::Empty(start))
}

fn start_obj<W: std::io::Write>(
    writer: &mut Writer<W>,
    ref_id: u64,
    name: Option<&str>,
) -> Result<()> {
    let mut start = element("Obj", name);
    start.push_attribute(("RefId", ref_id.to_string().as_str()));
    write_event(writer, Event::Start(start))
}

fn write_start<W: std::io::Write>(writer: &mut Writer<W>, tag: &str) -> Result<()> {
    write_event(writer, Event::Start(BytesStart::new(tag.to_string())))
}

fn write_end<W: std::io::Write>(writer: &mut Writer<W>, tag: &str) -> Result<()> {
    write_event(writer, Event::End(BytesEnd::new(tag.to_string())))
}

// ----------------------------------------------------------------------------
// XML tree
// ----------------------------------------------------------------------------

/// A parsed XML element. CLIXML documents are small (one message body),
/// so decoding materializes the tree before interpretation.
#[derive(Debug, Clone)]
struct XmlNode {
    tag: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn child(&self, tag: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.tag == tag)
    }
}

fn node_from(start: &BytesStart<'_>) -> std::result::Result<XmlNode, SerializationError> {
    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.push((key, value));
    }
    Ok(XmlNode {
        tag,
        attrs,
        text: String::new(),
        children: Vec::new(),
    })
}

fn parse_nodes(input: &str) -> std::result::Result<Vec<XmlNode>, SerializationError> {
    let mut reader = Reader::from_str(input);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut roots: Vec<XmlNode> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(node_from(&start)?),
            Event::Empty(start) => {
                let node = node_from(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => roots.push(node),
                }
            }
            Event::End(_) => {
                // The reader validates end-tag names; the stack cannot be
                // empty here for well-formed input.
                let node = stack
                    .pop()
                    .ok_or_else(|| SerializationError::malformed("unbalanced end tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => roots.push(node),
                }
            }
            Event::Text(text) => {
                let content = text.unescape()?;
                match stack.last_mut() {
                    Some(node) => node.text.push_str(&content),
                    None if content.trim().is_empty() => {}
                    None => {
                        return Err(SerializationError::malformed(
                            "text outside of any element",
                        ))
                    }
                }
            }
            Event::CData(data) => {
                let content = String::from_utf8_lossy(&data.into_inner()).into_owned();
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&content);
                }
            }
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }

    if !stack.is_empty() {
        return Err(SerializationError::malformed("unclosed element"));
    }
    Ok(roots)
}

// ----------------------------------------------------------------------------
// Deserializer
// ----------------------------------------------------------------------------

const SEQUENCE_TAGS: [(&str, fn(Vec<PsValue>) -> Container); 4] = [
    ("STK", Container::Stack),
    ("QUE", Container::Queue),
    ("LST", Container::List),
    ("IE", Container::Enumerable),
];

/// A single-document CLIXML decoder mirroring the serializer's reference
/// tables.
pub struct Deserializer<'r> {
    registry: &'r TypeRegistry,
    obj_refs: HashMap<String, PsValue>,
    tn_refs: HashMap<String, Vec<String>>,
}

impl<'r> Deserializer<'r> {
    pub fn new(registry: &'r TypeRegistry) -> Self {
        Self {
            registry,
            obj_refs: HashMap::new(),
            tn_refs: HashMap::new(),
        }
    }

    /// Deserialize every top-level element of a CLIXML document.
    pub fn deserialize(&mut self, input: &str) -> Result<Vec<PsValue>> {
        let nodes = parse_nodes(input)?;
        nodes.iter().map(|node| self.value_from(node)).collect()
    }

    fn value_from(&mut self, node: &XmlNode) -> Result<PsValue> {
        let text = node.text.as_str();
        let parse_err =
            |what: &str| PsrpError::from(SerializationError::malformed(format!(
                "invalid {what} '{text}'",
                text = text
            )));

        let value = match node.tag.as_str() {
            "Ref" => {
                let ref_id = node
                    .attr("RefId")
                    .ok_or_else(|| SerializationError::malformed("Ref without RefId"))?;
                return self
                    .obj_refs
                    .get(ref_id)
                    .cloned()
                    .ok_or_else(|| {
                        SerializationError::malformed(format!(
                            "unresolved object reference {ref_id}"
                        ))
                        .into()
                    });
            }
            "Nil" => PsValue::Null,
            "B" => PsValue::Bool(text.eq_ignore_ascii_case("true")),
            "S" => PsValue::String(unescape_string(text)),
            "C" => PsValue::Char(text.parse().map_err(|_| parse_err("char"))?),
            "By" => PsValue::Byte(text.parse().map_err(|_| parse_err("byte"))?),
            "SB" => PsValue::SByte(text.parse().map_err(|_| parse_err("signed byte"))?),
            "U16" => PsValue::UInt16(text.parse().map_err(|_| parse_err("uint16"))?),
            "I16" => PsValue::Int16(text.parse().map_err(|_| parse_err("int16"))?),
            "U32" => PsValue::UInt32(text.parse().map_err(|_| parse_err("uint32"))?),
            "I32" => PsValue::Int32(text.parse().map_err(|_| parse_err("int32"))?),
            "U64" => PsValue::UInt64(text.parse().map_err(|_| parse_err("uint64"))?),
            "I64" => PsValue::Int64(text.parse().map_err(|_| parse_err("int64"))?),
            "Sg" => PsValue::Single(text::parse_f32(text)?),
            "Db" => PsValue::Double(text::parse_f64(text)?),
            "D" => PsValue::Decimal(
                text.parse::<Decimal>().map_err(|_| parse_err("decimal"))?,
            ),
            "DT" => PsValue::DateTime(text::parse_datetime(text)?),
            "TS" => PsValue::Duration(text::parse_duration(text)?),
            "BA" => PsValue::ByteArray(BASE64.decode(text.trim()).map_err(|_| parse_err("byte array"))?),
            "G" => PsValue::Guid(Uuid::parse_str(text.trim()).map_err(|_| parse_err("guid"))?),
            "URI" => PsValue::Uri(unescape_str(text)),
            "XD" => PsValue::XmlDocument(unescape_str(text)),
            "SBK" => PsValue::ScriptBlock(unescape_str(text)),
            "Version" => PsValue::Version(
                text.trim().parse::<PsVersion>().map_err(|_| parse_err("version"))?,
            ),
            "SS" => PsValue::SecureString(PsSecureString::Encrypted(text.to_string())),
            "Obj" => self.object_from(node)?,
            other => return Err(SerializationError::unexpected_tag(other).into()),
        };
        Ok(value)
    }

    fn object_from(&mut self, node: &XmlNode) -> Result<PsValue> {
        let ref_id = node.attr("RefId").map(str::to_string);

        let mut type_names: Vec<String> = Vec::new();
        if let Some(tn) = node.child("TN") {
            type_names = tn
                .children
                .iter()
                .filter(|c| c.tag == "T")
                .map(|c| unescape_str(&c.text))
                .collect();
            if let Some(tn_ref_id) = tn.attr("RefId") {
                self.tn_refs
                    .insert(tn_ref_id.to_string(), type_names.clone());
            }
        } else if let Some(tn_ref) = node.child("TNRef") {
            let tn_ref_id = tn_ref
                .attr("RefId")
                .ok_or_else(|| SerializationError::malformed("TNRef without RefId"))?;
            type_names = self
                .tn_refs
                .get(tn_ref_id)
                .cloned()
                .ok_or_else(|| {
                    SerializationError::malformed(format!(
                        "unresolved type name reference {tn_ref_id}"
                    ))
                })?;
        }

        let mut obj = PsObject::new();

        for child in &node.children {
            match child.tag.as_str() {
                "TN" | "TNRef" => {}
                "Props" => obj.adapted = self.properties_from(child)?,
                "MS" => obj.extended = self.properties_from(child)?,
                "ToString" => obj.to_string = Some(unescape_str(&child.text)),
                "DCT" => {
                    let mut entries = Vec::with_capacity(child.children.len());
                    for entry in &child.children {
                        let key = entry
                            .children
                            .iter()
                            .find(|c| c.attr("N") == Some("Key"))
                            .ok_or_else(|| {
                                SerializationError::malformed("dict entry without Key")
                            })?;
                        let value = entry
                            .children
                            .iter()
                            .find(|c| c.attr("N") == Some("Value"))
                            .ok_or_else(|| {
                                SerializationError::malformed("dict entry without Value")
                            })?;
                        entries.push((self.value_from(key)?, self.value_from(value)?));
                    }
                    obj.container = Some(Container::Dict(entries));
                }
                tag if SEQUENCE_TAGS.iter().any(|(t, _)| *t == tag) => {
                    let build = SEQUENCE_TAGS
                        .iter()
                        .find(|(t, _)| *t == tag)
                        .map(|(_, build)| *build)
                        .expect("matched by guard");
                    let items = child
                        .children
                        .iter()
                        .map(|c| self.value_from(c))
                        .collect::<Result<Vec<_>>>()?;
                    obj.container = Some(build(items));
                }
                _ => match self.value_from(child) {
                    Ok(primitive) => {
                        obj.primitive = Some(primitive);
                    }
                    // Unknown elements under Obj are ignored for forward
                    // compatibility.
                    Err(PsrpError::Serialization(SerializationError::UnexpectedTag { .. })) => {}
                    Err(other) => return Err(other),
                },
            }
        }

        let value = self.finish_object(obj, type_names)?;
        if let Some(ref_id) = ref_id {
            self.obj_refs.insert(ref_id, value.clone());
        }
        Ok(value)
    }

    fn finish_object(&self, mut obj: PsObject, type_names: Vec<String>) -> Result<PsValue> {
        let registration = self.registry.lookup(&type_names);

        // Registered enums rehydrate from their wrapped numeric value.
        if let Some(reg) = registration {
            if reg.rehydrate {
                if let TypeShape::Enum { tag, .. } = &reg.shape {
                    if let Some(raw) = obj.primitive.as_ref().and_then(PsValue::as_i64) {
                        return Ok(PsValue::Enum(Rc::new(PsEnum {
                            type_names: reg.type_names.clone(),
                            value: raw,
                            tag: *tag,
                            labels: reg.labels_for(raw),
                        })));
                    }
                }
            }
        }

        // A bare wrapper around a single primitive collapses to the
        // primitive itself.
        if obj.container.is_none()
            && obj.adapted.is_empty()
            && obj.extended.is_empty()
            && type_names.is_empty()
            && obj.to_string.is_none()
        {
            if let Some(primitive) = obj.primitive {
                return Ok(primitive);
            }
        }

        obj.type_names = if type_names.is_empty() {
            type_names
        } else if obj.container.is_some() {
            // Collection types always rehydrate; PowerShell's deserializer
            // does the same for its collection wrappers.
            type_names
        } else {
            self.registry.resolve_type_names(&type_names)
        };

        Ok(PsValue::object(obj))
    }

    fn properties_from(&mut self, node: &XmlNode) -> Result<crate::value::PropertyBag> {
        let mut bag = crate::value::PropertyBag::new();
        for child in &node.children {
            let name = child
                .attr("N")
                .map(unescape_str)
                .ok_or_else(|| SerializationError::malformed("property without N attribute"))?;
            let value = self.value_from(child)?;
            bag.insert(name, value);
        }
        Ok(bag)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, SessionCrypto};
    use crate::value::{DateTimeKind, PsDateTime, PsDuration, PsString};

    fn round_trip(value: &PsValue) -> PsValue {
        let xml = serialize_clixml(value).unwrap();
        let mut decoded = deserialize_clixml(&xml).unwrap();
        assert_eq!(decoded.len(), 1, "expected one value from {xml}");
        decoded.remove(0)
    }

    #[test]
    fn test_primitive_forms() {
        assert_eq!(serialize_clixml(&PsValue::Null).unwrap(), "<Nil/>");
        assert_eq!(serialize_clixml(&PsValue::Bool(true)).unwrap(), "<B>true</B>");
        assert_eq!(
            serialize_clixml(&PsValue::from("hello")).unwrap(),
            "<S>hello</S>"
        );
        assert_eq!(serialize_clixml(&PsValue::Char(97)).unwrap(), "<C>97</C>");
        assert_eq!(
            serialize_clixml(&PsValue::Int32(-42)).unwrap(),
            "<I32>-42</I32>"
        );
        assert_eq!(
            serialize_clixml(&PsValue::from("")).unwrap(),
            "<S/>"
        );
    }

    #[test]
    fn test_lone_surrogate_scenario() {
        // A single unpaired UTF-16 high surrogate.
        let value = PsValue::String(PsString::from_code_units(vec![0xD800]));
        let xml = serialize_clixml(&value).unwrap();
        assert_eq!(xml, "<S>_xD800_</S>");
        assert_eq!(round_trip(&value), value);

        // The literal text `_x0041_` must not decode to `A`.
        let value = PsValue::from("_x0041_");
        let xml = serialize_clixml(&value).unwrap();
        assert_eq!(xml, "<S>_x005F_x0041_</S>");
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_datetime_kind_scenarios() {
        let naive = text::parse_datetime("2024-01-02T03:04:05").unwrap();
        assert_eq!(naive.kind, DateTimeKind::Unspecified);
        let xml = serialize_clixml(&PsValue::DateTime(naive)).unwrap();
        assert_eq!(xml, "<DT>2024-01-02T03:04:05</DT>");

        let utc = text::parse_datetime("2024-01-02T03:04:05Z").unwrap();
        let xml = serialize_clixml(&PsValue::DateTime(utc)).unwrap();
        assert_eq!(xml, "<DT>2024-01-02T03:04:05Z</DT>");

        let offset = text::parse_datetime("2024-01-02T03:04:05+05:30").unwrap();
        let xml = serialize_clixml(&PsValue::DateTime(offset)).unwrap();
        assert_eq!(xml, "<DT>2024-01-02T03:04:05+05:30</DT>");

        for value in [naive, utc, offset] {
            assert_eq!(round_trip(&PsValue::DateTime(value)), PsValue::DateTime(value));
        }
    }

    #[test]
    fn test_xml_metacharacters_escaped() {
        let value = PsValue::from("a<b&c>d");
        let xml = serialize_clixml(&value).unwrap();
        assert_eq!(xml, "<S>a&lt;b&amp;c&gt;d</S>");
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_object_with_properties() {
        let mut obj = PsObject::custom_object();
        obj.extended.insert("Name", "duke");
        obj.extended.insert("Level", 42i32);
        obj.to_string = Some("duke".to_string());
        let value = PsValue::object(obj);

        let xml = serialize_clixml(&value).unwrap();
        assert!(xml.starts_with("<Obj RefId=\"0\">"));
        assert!(xml.contains("<TN RefId=\"0\">"));
        assert!(xml.contains("<T>System.Management.Automation.PSCustomObject</T>"));
        assert!(xml.contains("<MS><S N=\"Name\">duke</S><I32 N=\"Level\">42</I32></MS>"));

        let decoded = round_trip(&value);
        let decoded_obj = decoded.as_object().unwrap();
        assert_eq!(
            decoded_obj.type_names[0],
            "System.Management.Automation.PSCustomObject"
        );
        assert_eq!(
            decoded.property("Name").and_then(PsValue::as_str).as_deref(),
            Some("duke")
        );
        assert_eq!(decoded.property("Level"), Some(&PsValue::Int32(42)));
    }

    #[test]
    fn test_unregistered_type_gets_deserialized_prefix() {
        let mut obj = PsObject::with_type_names(vec![
            "Contoso.Widget".to_string(),
            "System.Object".to_string(),
        ]);
        obj.extended.insert("Id", 1i32);
        let decoded = round_trip(&PsValue::object(obj));
        assert_eq!(
            decoded.as_object().unwrap().type_names,
            vec!["Deserialized.Contoso.Widget", "Deserialized.System.Object"]
        );
    }

    #[test]
    fn test_dict_not_reference_deduplicated() {
        let dict = Rc::new({
            let mut obj = PsObject::with_type_names(vec![
                "System.Collections.Hashtable".to_string(),
                "System.Object".to_string(),
            ]);
            obj.container = Some(Container::Dict(vec![(
                PsValue::from("k"),
                PsValue::Int32(1),
            )]));
            obj
        });
        let list = PsValue::list(vec![
            PsValue::Object(Rc::clone(&dict)),
            PsValue::Object(Rc::clone(&dict)),
        ]);

        let xml = serialize_clixml(&list).unwrap();
        assert_eq!(xml.matches("<DCT>").count(), 2);
        assert!(!xml.contains("<Ref "));
    }

    #[test]
    fn test_shared_object_emits_ref() {
        let shared = Rc::new({
            let mut obj = PsObject::custom_object();
            obj.extended.insert("X", 1i32);
            obj
        });
        let list = PsValue::list(vec![
            PsValue::Object(Rc::clone(&shared)),
            PsValue::Object(Rc::clone(&shared)),
        ]);

        let xml = serialize_clixml(&list).unwrap();
        assert_eq!(xml.matches("<Ref ").count(), 1);

        // The back-reference decodes to the same structural value.
        let decoded = round_trip(&list);
        let items = decoded.items().unwrap();
        assert_eq!(items[0], items[1]);
    }

    #[test]
    fn test_type_name_table_dedup() {
        let make = || {
            let mut obj = PsObject::custom_object();
            obj.extended.insert("A", 1i32);
            PsValue::object(obj)
        };
        let list = PsValue::list(vec![make(), make()]);
        let xml = serialize_clixml(&list).unwrap();
        assert_eq!(xml.matches("<TN RefId=").count(), 2); // list + first object
        assert_eq!(xml.matches("<TNRef RefId=").count(), 1);
        round_trip(&list);
    }

    #[test]
    fn test_containers_round_trip() {
        let mut stack = PsObject::with_type_names(vec![
            "System.Collections.Stack".to_string(),
            "System.Object".to_string(),
        ]);
        stack.container = Some(Container::Stack(vec![PsValue::Int32(1), PsValue::Int32(2)]));
        let value = PsValue::object(stack);
        let xml = serialize_clixml(&value).unwrap();
        assert!(xml.contains("<STK><I32>1</I32><I32>2</I32></STK>"));
        assert_eq!(round_trip(&value), value);

        let dict = PsValue::dict(vec![
            (PsValue::from("one"), PsValue::Int32(1)),
            (PsValue::Int32(2), PsValue::from("two")),
        ]);
        assert_eq!(round_trip(&dict), dict);
    }

    #[test]
    fn test_secure_string_requires_cipher() {
        let value = PsValue::SecureString(PsSecureString::Plaintext("secret".to_string()));
        assert!(serialize_clixml(&value).unwrap_err().is_crypto_unavailable());

        let mut crypto = SessionCrypto::new();
        crypto.register_session_key(&[7u8; 32]).unwrap();
        let xml = serialize_clixml_with(&value, &crypto).unwrap();
        assert!(xml.starts_with("<SS>"));

        let decoded = deserialize_clixml(&xml).unwrap().remove(0);
        let PsValue::SecureString(PsSecureString::Encrypted(ciphertext)) = decoded else {
            panic!("expected an encrypted secure string");
        };
        assert_eq!(crypto.decrypt(&ciphertext).unwrap(), "secret");
    }

    #[test]
    fn test_duration_round_trip() {
        let value = PsValue::Duration(PsDuration::from_nanos(-3_725_500_000_000));
        let xml = serialize_clixml(&value).unwrap();
        assert_eq!(xml, "<TS>-PT1H2M5.5S</TS>");
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_multiple_top_level_values() {
        let decoded = deserialize_clixml("<I32>1</I32><S>two</S>").unwrap();
        assert_eq!(decoded, vec![PsValue::Int32(1), PsValue::from("two")]);
    }

    #[test]
    fn test_unknown_tags_under_obj_ignored() {
        let xml = "<Obj RefId=\"0\"><MS><I32 N=\"A\">1</I32></MS><Bogus>x</Bogus></Obj>";
        let decoded = deserialize_clixml(xml).unwrap().remove(0);
        assert_eq!(decoded.property("A"), Some(&PsValue::Int32(1)));
    }

    #[test]
    fn test_malformed_and_unexpected() {
        assert!(matches!(
            deserialize_clixml("<S>unterminated"),
            Err(PsrpError::Serialization(SerializationError::MalformedXml { .. }))
        ));
        assert!(matches!(
            deserialize_clixml("<Frobnicate/>"),
            Err(PsrpError::Serialization(SerializationError::UnexpectedTag { .. }))
        ));
    }

    #[test]
    fn test_datetime_utc_round_trip_value() {
        let value = PsValue::DateTime(PsDateTime {
            datetime: text::parse_datetime("2021-06-01T08:09:10.1234567Z")
                .unwrap()
                .datetime,
            kind: DateTimeKind::Utc,
        });
        assert_eq!(round_trip(&value), value);
    }
}

use anyhow::{anyhow, bail, Result};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::collections::BTreeMap;

/// An owned XML element tree.
///
/// Process definitions are small documents that get walked recursively by
/// the flow-expression builder and re-serialized by `call` (to stamp the
/// `parent` attribute onto a sub-process root), so a plain owned tree beats
/// streaming here. Built on quick-xml events.
#[derive(Clone, Debug, PartialEq)]
pub struct XmlElement {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    /// Unescaped, trimmed character data directly inside this element.
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            attrs: BTreeMap::new(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    /// Parse a document and return its root element.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_reader(xml.as_bytes());
        let mut buf = Vec::new();
        // Parents of the element currently being filled.
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut current: Option<XmlElement> = None;
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    let element = element_from_start(e)?;
                    if let Some(parent) = current.take() {
                        stack.push(parent);
                    }
                    current = Some(element);
                }
                Ok(Event::Empty(ref e)) => {
                    let element = element_from_start(e)?;
                    match current.as_mut() {
                        Some(parent) => parent.children.push(element),
                        None => {
                            if root.is_some() {
                                bail!("multiple root elements");
                            }
                            root = Some(element);
                        }
                    }
                }
                Ok(Event::End(_)) => {
                    let finished = current
                        .take()
                        .ok_or_else(|| anyhow!("unbalanced closing tag"))?;
                    match stack.pop() {
                        Some(mut parent) => {
                            parent.children.push(finished);
                            current = Some(parent);
                        }
                        None => {
                            if root.is_some() {
                                bail!("multiple root elements");
                            }
                            root = Some(finished);
                        }
                    }
                }
                Ok(Event::Text(ref e)) => {
                    if let Some(element) = current.as_mut() {
                        let text = e.unescape()?;
                        let text = text.trim();
                        if !text.is_empty() {
                            element.text.push_str(text);
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(anyhow!("XML parse error: {}", e)),
            }
            buf.clear();
        }

        root.ok_or_else(|| anyhow!("empty document"))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn require_attr(&self, name: &str) -> Result<&str> {
        self.attr(name)
            .ok_or_else(|| anyhow!("<{}> is missing attribute '{}'", self.tag, name))
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        self.attrs.insert(name.to_string(), value.to_string());
    }

    /// Serialize back to XML text.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        write_element(&mut writer, self)?;
        Ok(String::from_utf8(writer.into_inner())?)
    }
}

fn element_from_start(e: &BytesStart) -> Result<XmlElement> {
    let tag = String::from_utf8(e.name().as_ref().to_vec())?;
    let mut element = XmlElement::new(&tag);
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8(attr.key.as_ref().to_vec())?;
        let value = attr.unescape_value()?.into_owned();
        element.attrs.insert(key, value);
    }
    Ok(element)
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &XmlElement) -> Result<()> {
    let mut start = BytesStart::new(element.tag.as_str());
    for (key, value) in &element.attrs {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.text.is_empty() && element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    if !element.text.is_empty() {
        writer.write_event(Event::Text(BytesText::new(&element.text)))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.tag.as_str())))?;
    Ok(())
}

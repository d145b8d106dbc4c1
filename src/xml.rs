use crate::errors::StructuralError;
use anyhow::anyhow;
use indexmap::IndexMap;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::{Read, Write};

/// One element of the audit document. Tags are stored as local names; the
/// namespace prefix carried by the source document is dropped on ingest and
/// the root element's `xmlns` attributes are kept verbatim.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Element {
    pub tag: String,
    pub attributes: IndexMap<String, String>,
    pub text: Option<String>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn with_text(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// First child with the given tag, or `None`. Absent optional children
    /// resolve to `None` rather than raising.
    pub fn child(&self, tag: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.tag == tag)
    }

    pub fn child_mut(&mut self, tag: &str) -> Option<&mut Element> {
        self.children.iter_mut().find(|child| child.tag == tag)
    }

    pub fn children_with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |child| child.tag == tag)
    }

    /// Descend through `path` one tag at a time, returning the first match at
    /// each level.
    pub fn tag_path(&self, path: &[&str]) -> Option<&Element> {
        let mut current = self;
        for tag in path {
            current = current.child(tag)?;
        }
        Some(current)
    }

    pub fn tag_path_mut(&mut self, path: &[&str]) -> Option<&mut Element> {
        let mut current = self;
        for tag in path {
            current = current.child_mut(tag)?;
        }
        Some(current)
    }

    pub fn tag_path_text(&self, path: &[&str]) -> Option<&str> {
        self.tag_path(path).and_then(Element::text)
    }

    /// Child with the given tag, created in place if absent.
    pub fn ensure_child(&mut self, tag: &str) -> &mut Element {
        if let Some(idx) = self.children.iter().position(|child| child.tag == tag) {
            &mut self.children[idx]
        } else {
            self.children.push(Element::new(tag));
            self.children.last_mut().unwrap()
        }
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(child);
    }

    pub fn remove_children(&mut self, tag: &str) {
        self.children.retain(|child| child.tag != tag);
    }

    /// Validate that this element carries the expected tag; this is how
    /// malformed documents are caught early in lieu of schema validation.
    pub fn expect_tag(&self, expected: &str) -> Result<&Element, StructuralError> {
        if self.tag == expected {
            Ok(self)
        } else {
            Err(StructuralError::WrongTag {
                expected: expected.to_string(),
                actual: self.tag.clone(),
            })
        }
    }
}

/// Parse a namespaced XML document into an [`Element`] tree.
pub fn parse_document(mut input: impl Read) -> anyhow::Result<Element> {
    let mut raw = String::new();
    input.read_to_string(&mut raw)?;
    let mut reader = Reader::from_str(&raw);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                stack.push(element_from_start(&start)?);
            }
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                let value = text.unescape()?;
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    if let Some(current) = stack.last_mut() {
                        current.text = Some(trimmed.to_string());
                    }
                }
            }
            Event::CData(data) => {
                let value = String::from_utf8_lossy(&data).into_owned();
                if let Some(current) = stack.last_mut() {
                    current.text = Some(value);
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| anyhow!("unbalanced closing tag in document"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Eof => break,
            // declaration, comments, processing instructions and doctypes
            // carry no document content
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(anyhow!("document ended with unclosed elements"));
    }
    root.ok_or_else(|| anyhow!("document contains no root element"))
}

fn element_from_start(start: &BytesStart) -> anyhow::Result<Element> {
    let tag = String::from_utf8_lossy(start.name().local_name().as_ref()).into_owned();
    let mut element = Element::new(tag);
    for attribute in start.attributes() {
        let attribute = attribute?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute.unescape_value()?.into_owned();
        element.attributes.insert(key, value);
    }
    Ok(element)
}

fn attach(
    stack: &mut Vec<Element>,
    root: &mut Option<Element>,
    element: Element,
) -> anyhow::Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_some() {
                return Err(anyhow!("document contains more than one root element"));
            }
            *root = Some(element);
        }
    }
    Ok(())
}

/// Serialize an [`Element`] tree back out as indented XML.
pub fn write_document(root: &Element, out: impl Write) -> anyhow::Result<()> {
    let mut writer = Writer::new_with_indent(out, b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_element(&mut writer, root)?;
    Ok(())
}

fn write_element<W: Write>(writer: &mut Writer<W>, element: &Element) -> anyhow::Result<()> {
    let mut start = BytesStart::new(element.tag.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() && element.text.is_none() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    if let Some(text) = &element.text {
        writer.write_event(Event::Text(BytesText::new(text)))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.tag.as_str())))?;
    Ok(())
}

//! Minimal XML tree reader for WeChat payloads.
//!
//! WeChat pushes flat `<xml>` documents whose leaves are either plain text or
//! CDATA sections. Nested elements only show up in replies (`<Articles>`), so
//! a small owned tree is all the parsing layer needs.

use quick_xml::events::Event;
use quick_xml::Reader;

/// Nesting deeper than this is not a WeChat document.
const MAX_DEPTH: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("malformed xml at byte {position}: {source}")]
    Syntax {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },
    #[error("xml text is not valid utf-8")]
    Encoding,
    #[error("document has no root element")]
    Empty,
    #[error("unbalanced element `{0}`")]
    Unbalanced(String),
    #[error("document nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
    #[error("doctype declarations are not accepted")]
    DocType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn parse(input: &[u8]) -> Result<Self, XmlError> {
        let mut reader = Reader::from_reader(input);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            let event = reader.read_event().map_err(|source| XmlError::Syntax {
                position: reader.error_position(),
                source,
            })?;
            match event {
                Event::Start(start) => {
                    if stack.len() >= MAX_DEPTH {
                        return Err(XmlError::TooDeep);
                    }
                    let name = std::str::from_utf8(start.name().as_ref())
                        .map_err(|_| XmlError::Encoding)?
                        .to_string();
                    stack.push(XmlElement {
                        name,
                        ..Default::default()
                    });
                }
                Event::Empty(start) => {
                    let name = std::str::from_utf8(start.name().as_ref())
                        .map_err(|_| XmlError::Encoding)?
                        .to_string();
                    let element = XmlElement {
                        name,
                        ..Default::default()
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None if root.is_none() => root = Some(element),
                        None => {}
                    }
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        let text = text.unescape().map_err(|source| XmlError::Syntax {
                            position: reader.buffer_position(),
                            source,
                        })?;
                        current.text.push_str(&text);
                    }
                }
                Event::CData(cdata) => {
                    if let Some(current) = stack.last_mut() {
                        let raw = cdata.into_inner();
                        let text = std::str::from_utf8(&raw).map_err(|_| XmlError::Encoding)?;
                        current.text.push_str(text);
                    }
                }
                Event::End(end) => {
                    let Some(mut element) = stack.pop() else {
                        let name = String::from_utf8_lossy(end.name().as_ref()).to_string();
                        return Err(XmlError::Unbalanced(name));
                    };
                    // Indentation between child elements; leaf text is kept verbatim.
                    if !element.children.is_empty() && element.text.trim().is_empty() {
                        element.text.clear();
                    }
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None if root.is_none() => root = Some(element),
                        None => {}
                    }
                }
                Event::DocType(_) => return Err(XmlError::DocType),
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.pop() {
            return Err(XmlError::Unbalanced(open.name));
        }
        root.ok_or(XmlError::Empty)
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Text of the first child named `name`, if present and non-empty.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name)
            .map(|child| child.text.as_str())
            .filter(|text| !text.is_empty())
    }
}

/// Wraps `text` in CDATA, splitting any embedded terminator.
pub fn cdata(text: &str) -> String {
    format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_document_with_cdata_and_text() {
        let doc = br#"<xml>
            <ToUserName><![CDATA[gh_123]]></ToUserName>
            <CreateTime>1348831860</CreateTime>
            <Content><![CDATA[a < b & c]]></Content>
        </xml>"#;
        let root = XmlElement::parse(doc).unwrap();
        assert_eq!(root.name, "xml");
        assert_eq!(root.child_text("ToUserName"), Some("gh_123"));
        assert_eq!(root.child_text("CreateTime"), Some("1348831860"));
        assert_eq!(root.child_text("Content"), Some("a < b & c"));
        assert_eq!(root.child_text("Missing"), None);
    }

    #[test]
    fn parses_nested_items_in_order() {
        let doc = b"<xml><Articles><item><Title>a</Title></item>\
                    <item><Title>b</Title></item></Articles></xml>";
        let root = XmlElement::parse(doc).unwrap();
        let titles: Vec<_> = root
            .child("Articles")
            .unwrap()
            .children
            .iter()
            .filter_map(|item| item.child_text("Title"))
            .collect();
        assert_eq!(titles, vec!["a", "b"]);
    }

    #[test]
    fn plain_leaf_text_keeps_surrounding_whitespace() {
        let doc = b"<xml>\n  <Content>  hi  </Content>\n  <Blank>   </Blank>\n</xml>";
        let root = XmlElement::parse(doc).unwrap();
        assert_eq!(root.child_text("Content"), Some("  hi  "));
        assert_eq!(root.child_text("Blank"), Some("   "));
        assert!(root.text.is_empty());
    }

    #[test]
    fn unescapes_entities_in_plain_text() {
        let root = XmlElement::parse(b"<xml><Content>1 &lt; 2</Content></xml>").unwrap();
        assert_eq!(root.child_text("Content"), Some("1 < 2"));
    }

    #[test]
    fn rejects_unbalanced_and_empty_documents() {
        assert!(XmlElement::parse(b"<xml><Content>x</xml>").is_err());
        assert!(matches!(XmlElement::parse(b"   "), Err(XmlError::Empty)));
        assert!(XmlElement::parse(b"not xml at all").is_err());
    }

    #[test]
    fn rejects_doctype() {
        let doc = b"<!DOCTYPE xml [<!ENTITY x \"y\">]><xml><a>&x;</a></xml>";
        assert!(XmlElement::parse(doc).is_err());
    }

    #[test]
    fn cdata_escapes_terminator() {
        let wrapped = cdata("a]]>b");
        let root = XmlElement::parse(format!("<xml><C>{wrapped}</C></xml>").as_bytes()).unwrap();
        assert_eq!(root.child_text("C"), Some("a]]>b"));
    }
}

//! Owned element tree for a single materialised record

use quick_xml::events::{BytesCData, BytesStart, BytesText};

/// Start tag decoded into owned strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OpenTag {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    /// First problem found while decoding the tag
    pub problem: Option<String>,
}

impl OpenTag {
    pub fn parse(start: &BytesStart<'_>) -> Self {
        let mut problem = None;
        let name = match std::str::from_utf8(start.name().as_ref()) {
            Ok(name) => name.to_string(),
            Err(e) => {
                problem = Some(format!("invalid UTF-8 in element name: {}", e));
                String::from_utf8_lossy(start.name().as_ref()).into_owned()
            },
        };

        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = match attr {
                Ok(attr) => attr,
                Err(e) => {
                    problem.get_or_insert_with(|| format!("bad attribute on <{}>: {}", name, e));
                    continue;
                },
            };
            let key = match std::str::from_utf8(attr.key.as_ref()) {
                Ok(key) => key.to_string(),
                Err(e) => {
                    problem.get_or_insert_with(|| format!("invalid UTF-8 in attribute name: {}", e));
                    continue;
                },
            };
            match attr.unescape_value() {
                Ok(value) => {
                    if let Err(msg) = check_chars(&value) {
                        problem.get_or_insert_with(|| format!("attribute {}: {}", key, msg));
                    }
                    attrs.push((key, value.into_owned()));
                },
                Err(e) => {
                    problem.get_or_insert_with(|| format!("attribute {}: {}", key, e));
                },
            }
        }

        Self {
            name,
            attrs,
            problem,
        }
    }

    /// Tag name only, for cheap scanning
    pub fn name_of(start: &BytesStart<'_>) -> String {
        String::from_utf8_lossy(start.name().as_ref()).into_owned()
    }
}

pub(crate) fn decode_text(text: &BytesText<'_>) -> Result<String, String> {
    let value = text.unescape().map_err(|e| format!("bad text content: {}", e))?;
    check_chars(&value)?;
    Ok(value.into_owned())
}

pub(crate) fn decode_cdata(cdata: &BytesCData<'_>) -> Result<String, String> {
    let value = std::str::from_utf8(cdata)
        .map_err(|e| format!("invalid UTF-8 in CDATA: {}", e))?;
    check_chars(value)?;
    Ok(value.to_string())
}

/// Reject characters outside the XML 1.0 `Char` production
pub(crate) fn check_chars(value: &str) -> Result<(), String> {
    match value.chars().find(|c| !is_xml_char(*c)) {
        Some(c) => Err(format!("invalid character U+{:04X}", c as u32)),
        None => Ok(()),
    }
}

fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\u{9}' | '\u{A}' | '\u{D}'
        | '\u{20}'..='\u{D7FF}'
        | '\u{E000}'..='\u{FFFD}'
        | '\u{10000}'..='\u{10FFFF}')
}

/// One element of a record with its children
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn from_tag(tag: OpenTag) -> Self {
        Self {
            name: tag.name,
            attrs: tag.attrs,
            text: String::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text, `None` when empty
    pub fn text(&self) -> Option<String> {
        let text = self.text.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }

    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).and_then(Element::text)
    }

    /// Texts of `<outer><inner>..</inner>..</outer>`
    pub fn list(&self, outer: &str, inner: &str) -> Vec<String> {
        self.child(outer)
            .map(|o| o.children(inner).filter_map(Element::text).collect())
            .unwrap_or_default()
    }
}

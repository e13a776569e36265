//! Compact encoding of XML nodes stored as ordered records.
//!
//! ```text
//! Element:                [1][children:4][attributes:2][name]
//! Attribute:              [2][name_len:2][name][value]
//! Text:                   [3][content]
//! CDATA section:          [4][content]
//! Processing instruction: [7][target_len:2][target][data]
//! Comment:                [8][content]
//! ```
//!
//! An element is followed in storage order by its `children` direct
//! children, attributes first, each child element followed by its own
//! subtree.

use thiserror::Error;

const ELEMENT: u8 = 1;
const ATTRIBUTE: u8 = 2;
const TEXT: u8 = 3;
const CDATA: u8 = 4;
const PROCESSING_INSTRUCTION: u8 = 7;
const COMMENT: u8 = 8;

/// Reasons a record does not decode as a node.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("empty node record")]
    Empty,
    #[error("unknown node kind {0}")]
    UnknownKind(u8),
    #[error("truncated node record")]
    Truncated,
    #[error("node text is not valid UTF-8")]
    InvalidUtf8,
}

/// One XML node as stored in a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRecord {
    Element {
        name: String,
        /// Direct children stored after the element, attributes included.
        children: u32,
        attributes: u16,
    },
    Attribute {
        name: String,
        value: String,
    },
    Text(String),
    CData(String),
    Comment(String),
    ProcessingInstruction {
        target: String,
        data: String,
    },
}

fn text(bytes: &[u8]) -> Result<String, NodeError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| NodeError::InvalidUtf8)
}

fn split_prefixed(body: &[u8]) -> Result<(String, String), NodeError> {
    if body.len() < 2 {
        return Err(NodeError::Truncated);
    }
    let len = u16::from_le_bytes([body[0], body[1]]) as usize;
    let rest = &body[2..];
    if rest.len() < len {
        return Err(NodeError::Truncated);
    }
    Ok((text(&rest[..len])?, text(&rest[len..])?))
}

fn push_prefixed(buf: &mut Vec<u8>, first: &str, second: &str) {
    buf.extend_from_slice(&(first.len() as u16).to_le_bytes());
    buf.extend_from_slice(first.as_bytes());
    buf.extend_from_slice(second.as_bytes());
}

impl NodeRecord {
    pub fn element(name: impl Into<String>, children: u32, attributes: u16) -> Self {
        Self::Element {
            name: name.into(),
            children,
            attributes,
        }
    }

    pub fn attribute(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Attribute {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    /// Serializes the node.
    ///
    /// Names and targets longer than `u16::MAX` bytes are not representable.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Element {
                name,
                children,
                attributes,
            } => {
                buf.push(ELEMENT);
                buf.extend_from_slice(&children.to_le_bytes());
                buf.extend_from_slice(&attributes.to_le_bytes());
                buf.extend_from_slice(name.as_bytes());
            }
            Self::Attribute { name, value } => {
                buf.push(ATTRIBUTE);
                push_prefixed(&mut buf, name, value);
            }
            Self::Text(content) => {
                buf.push(TEXT);
                buf.extend_from_slice(content.as_bytes());
            }
            Self::CData(content) => {
                buf.push(CDATA);
                buf.extend_from_slice(content.as_bytes());
            }
            Self::Comment(content) => {
                buf.push(COMMENT);
                buf.extend_from_slice(content.as_bytes());
            }
            Self::ProcessingInstruction { target, data } => {
                buf.push(PROCESSING_INSTRUCTION);
                push_prefixed(&mut buf, target, data);
            }
        }
        buf
    }

    /// Parses a stored node.
    pub fn decode(bytes: &[u8]) -> Result<Self, NodeError> {
        let (&kind, body) = bytes.split_first().ok_or(NodeError::Empty)?;
        match kind {
            ELEMENT => {
                if body.len() < 6 {
                    return Err(NodeError::Truncated);
                }
                let children = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                let attributes = u16::from_le_bytes([body[4], body[5]]);
                Ok(Self::Element {
                    name: text(&body[6..])?,
                    children,
                    attributes,
                })
            }
            ATTRIBUTE => {
                let (name, value) = split_prefixed(body)?;
                Ok(Self::Attribute { name, value })
            }
            TEXT => Ok(Self::Text(text(body)?)),
            CDATA => Ok(Self::CData(text(body)?)),
            COMMENT => Ok(Self::Comment(text(body)?)),
            PROCESSING_INSTRUCTION => {
                let (target, data) = split_prefixed(body)?;
                Ok(Self::ProcessingInstruction { target, data })
            }
            other => Err(NodeError::UnknownKind(other)),
        }
    }

    /// Number of records that directly follow this node as its children.
    pub fn child_count(&self) -> u32 {
        match self {
            Self::Element { children, .. } => *children,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_layout() {
        let bytes = NodeRecord::element("doc", 3, 1).encode();
        assert_eq!(bytes, vec![1, 3, 0, 0, 0, 1, 0, b'd', b'o', b'c']);
    }

    #[test]
    fn test_decode_each_kind() {
        let nodes = [
            NodeRecord::element("a", 2, 0),
            NodeRecord::attribute("id", "x1"),
            NodeRecord::text("hello"),
            NodeRecord::CData("<raw>".into()),
            NodeRecord::Comment("note".into()),
            NodeRecord::ProcessingInstruction {
                target: "xml-stylesheet".into(),
                data: "href=\"a.xsl\"".into(),
            },
        ];
        for node in nodes {
            assert_eq!(NodeRecord::decode(&node.encode()).unwrap(), node);
        }
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(NodeRecord::decode(&[]), Err(NodeError::Empty));
        assert_eq!(NodeRecord::decode(&[9, 1]), Err(NodeError::UnknownKind(9)));
        assert_eq!(NodeRecord::decode(&[1, 0, 0]), Err(NodeError::Truncated));
        assert_eq!(NodeRecord::decode(&[2, 5, 0, b'a']), Err(NodeError::Truncated));
        assert_eq!(NodeRecord::decode(&[3, 0xFF]), Err(NodeError::InvalidUtf8));
    }

    #[test]
    fn test_child_count() {
        assert_eq!(NodeRecord::element("a", 4, 1).child_count(), 4);
        assert_eq!(NodeRecord::text("t").child_count(), 0);
    }
}

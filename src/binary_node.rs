//! The binary node codec: encodes/decodes the XMPP-like tree structure
//! exchanged after the Noise handshake into a compact tagged-token wire
//! format.
//!
//! The single-byte token dictionary used here is a **locally authored
//! stand-in**, not the reference client's real dictionary (that table is
//! not present anywhere in this codebase's sources and must be obtained
//! separately — see `DESIGN.md`). It covers the tags/attrs/values this
//! crate's own handshake and keep-alive traffic actually uses. Two peers
//! must agree on the same table to interoperate; this module is wire-format
//! **shaped** like the reference client, not wire-**compatible** with it.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BinaryNodeError {
    #[error("unexpected end of input while decoding")]
    UnexpectedEof,
    #[error("unknown token byte {0:#04x}")]
    UnknownToken(u8),
    #[error("trailing bytes after decoding a complete node")]
    TrailingBytes,
    #[error("string was not valid utf-8")]
    InvalidUtf8,
    #[error("list header declared 0 items for a node (a node always has at least a tag)")]
    EmptyNode,
}

type Result<T> = std::result::Result<T, BinaryNodeError>;

/// A node's payload: either absent, a raw byte string, or a list of child
/// nodes. Never both a leaf payload and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeContent {
    Bytes(Vec<u8>),
    Nodes(Vec<BinaryNode>),
}

/// The universal message unit exchanged over the wire once the Noise
/// transport is established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryNode {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub content: Option<NodeContent>,
}

impl BinaryNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
            content: None,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_children(mut self, children: Vec<BinaryNode>) -> Self {
        self.content = Some(NodeContent::Nodes(children));
        self
    }

    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.content = Some(NodeContent::Bytes(bytes));
        self
    }

    /// Returns the first immediate child with the given tag, if the
    /// content is a node list.
    pub fn child(&self, tag: &str) -> Option<&BinaryNode> {
        match &self.content {
            Some(NodeContent::Nodes(children)) => children.iter().find(|c| c.tag == tag),
            _ => None,
        }
    }
}

const LIST_EMPTY: u8 = 0x00;
const DICTIONARY_0_BASE: u8 = 0x01;
const DICTIONARY_0_END: u8 = 0xC8;
const DICTIONARY_1: u8 = 0xC9;
const LIST_8: u8 = 0xF0;
const LIST_20: u8 = 0xF1;
const BINARY_8: u8 = 0xF2;
const BINARY_20: u8 = 0xF3;
const BINARY_32: u8 = 0xF4;
const JID_PAIR: u8 = 0xF5;
const NIBBLE_8: u8 = 0xF6;

/// Bank 0 of the stand-in single-byte token dictionary. Index `i` encodes
/// as byte `DICTIONARY_0_BASE + i`.
const DICTIONARY_BANK_0: &[&str] = &[
    "iq", "to", "type", "get", "set", "result", "error", "id", "xmlns", "ping", "w:p", "success",
    "failure", "stream:error", "stream:features", "code", "text", "notification", "message",
    "receipt", "ack", "presence", "chatstate", "call", "list", "item", "value", "key", "from",
    "participant", "pair-device", "pair-success", "ref", "ttl", "platform", "features", "reason",
    "creation", "location", "registration", "passive", "active",
];

/// Bank 1, selected with the [`DICTIONARY_1`] prefix byte. Kept small and
/// separate from bank 0 to mirror the two-bank shape the real dictionary
/// uses, without pretending to reproduce it.
const DICTIONARY_BANK_1: &[&str] = &["s.whatsapp.net", "g.us", "broadcast", "c.us", "lid"];

const KNOWN_JID_SERVERS: &[&str] = &["s.whatsapp.net", "g.us", "broadcast", "c.us", "lid"];

fn dictionary_lookup(s: &str) -> Option<(u8, bool)> {
    if let Some(index) = DICTIONARY_BANK_0.iter().position(|&entry| entry == s) {
        return Some((DICTIONARY_0_BASE + index as u8, false));
    }
    if let Some(index) = DICTIONARY_BANK_1.iter().position(|&entry| entry == s) {
        return Some((index as u8, true));
    }
    None
}

fn dictionary_resolve(index: u8, bank1: bool) -> Option<&'static str> {
    if bank1 {
        DICTIONARY_BANK_1.get(index as usize).copied()
    } else {
        let offset = index.checked_sub(DICTIONARY_0_BASE)? as usize;
        DICTIONARY_BANK_0.get(offset).copied()
    }
}

fn split_jid(s: &str) -> Option<(&str, &str)> {
    if let Some((user, server)) = s.split_once('@') {
        return Some((user, server));
    }
    if KNOWN_JID_SERVERS.contains(&s) {
        return Some(("", s));
    }
    None
}

/// Encodes a [`BinaryNode`] into its compact token-prefixed wire form.
pub fn encode(node: &BinaryNode) -> Vec<u8> {
    let mut out = Vec::new();
    encode_node(node, &mut out);
    out
}

fn encode_node(node: &BinaryNode, out: &mut Vec<u8>) {
    let item_count = 1 + 2 * node.attrs.len() + usize::from(node.content.is_some());
    write_list_header(item_count, out);
    write_component(&node.tag, out);
    for (key, value) in &node.attrs {
        write_component(key, out);
        write_value(value, out);
    }
    match &node.content {
        None => {}
        Some(NodeContent::Bytes(bytes)) => write_bytes_token(bytes, out),
        Some(NodeContent::Nodes(children)) => {
            write_list_header(children.len(), out);
            for child in children {
                encode_node(child, out);
            }
        }
    }
}

fn write_list_header(count: usize, out: &mut Vec<u8>) {
    if count == 0 {
        out.push(LIST_EMPTY);
    } else if count <= u8::MAX as usize {
        out.push(LIST_8);
        out.push(count as u8);
    } else {
        out.push(LIST_20);
        out.extend_from_slice(&(count as u32).to_be_bytes()[1..]);
    }
}

fn write_value(s: &str, out: &mut Vec<u8>) {
    if let Some((user, server)) = split_jid(s) {
        out.push(JID_PAIR);
        write_component(user, out);
        write_component(server, out);
    } else {
        write_component(s, out);
    }
}

fn write_component(s: &str, out: &mut Vec<u8>) {
    if let Some((token, bank1)) = dictionary_lookup(s) {
        if bank1 {
            out.push(DICTIONARY_1);
        }
        out.push(token);
        return;
    }
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        write_packed_nibble(s, out);
        return;
    }
    write_bytes_token(s.as_bytes(), out);
}

fn write_packed_nibble(digits: &str, out: &mut Vec<u8>) {
    out.push(NIBBLE_8);
    out.push(digits.len() as u8);
    let nibbles: Vec<u8> = digits.bytes().map(|b| b - b'0').collect();
    for pair in nibbles.chunks(2) {
        let high = pair[0];
        let low = pair.get(1).copied().unwrap_or(0x0F);
        out.push((high << 4) | low);
    }
}

fn write_bytes_token(bytes: &[u8], out: &mut Vec<u8>) {
    let len = bytes.len();
    if len <= u8::MAX as usize {
        out.push(BINARY_8);
        out.push(len as u8);
    } else if len <= 0x000F_FFFF {
        out.push(BINARY_20);
        out.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
    } else {
        out.push(BINARY_32);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.extend_from_slice(bytes);
}

/// Decodes a complete [`BinaryNode`] from `input`. The entire slice must be
/// consumed; trailing bytes are an error.
pub fn decode(input: &[u8]) -> Result<BinaryNode> {
    let mut cursor = Cursor { data: input, pos: 0 };
    let node = decode_node(&mut cursor)?;
    if cursor.pos != cursor.data.len() {
        return Err(BinaryNodeError::TrailingBytes);
    }
    Ok(node)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(BinaryNodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(BinaryNodeError::UnexpectedEof)?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(BinaryNodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }
}

fn decode_node(cursor: &mut Cursor) -> Result<BinaryNode> {
    let count = read_list_header(cursor)?;
    if count == 0 {
        return Err(BinaryNodeError::EmptyNode);
    }
    let tag = decode_component_string(cursor)?;
    let remaining = count - 1;
    let num_attrs = remaining / 2;
    let has_content = remaining % 2 == 1;

    let mut attrs = BTreeMap::new();
    for _ in 0..num_attrs {
        let key = decode_component_string(cursor)?;
        let value = decode_value_string(cursor)?;
        attrs.insert(key, value);
    }

    let content = if has_content {
        Some(decode_content(cursor)?)
    } else {
        None
    };

    Ok(BinaryNode { tag, attrs, content })
}

fn read_list_header(cursor: &mut Cursor) -> Result<usize> {
    match cursor.read_u8()? {
        LIST_EMPTY => Ok(0),
        LIST_8 => Ok(cursor.read_u8()? as usize),
        LIST_20 => {
            let bytes = cursor.read_bytes(3)?;
            Ok(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
        }
        other => Err(BinaryNodeError::UnknownToken(other)),
    }
}

fn decode_content(cursor: &mut Cursor) -> Result<NodeContent> {
    let next = *cursor.data.get(cursor.pos).ok_or(BinaryNodeError::UnexpectedEof)?;
    match next {
        LIST_EMPTY | LIST_8 | LIST_20 => {
            let count = read_list_header(cursor)?;
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                children.push(decode_node(cursor)?);
            }
            Ok(NodeContent::Nodes(children))
        }
        _ => Ok(NodeContent::Bytes(decode_raw_bytes(cursor)?)),
    }
}

fn decode_value_string(cursor: &mut Cursor) -> Result<String> {
    let next = *cursor.data.get(cursor.pos).ok_or(BinaryNodeError::UnexpectedEof)?;
    if next == JID_PAIR {
        cursor.pos += 1;
        let user = decode_component_string(cursor)?;
        let server = decode_component_string(cursor)?;
        if user.is_empty() {
            return Ok(server);
        }
        return Ok(format!("{user}@{server}"));
    }
    decode_component_string(cursor)
}

fn decode_component_string(cursor: &mut Cursor) -> Result<String> {
    let next = *cursor.data.get(cursor.pos).ok_or(BinaryNodeError::UnexpectedEof)?;
    match next {
        DICTIONARY_1 => {
            cursor.pos += 1;
            let index = cursor.read_u8()?;
            dictionary_resolve(index, true)
                .map(str::to_owned)
                .ok_or(BinaryNodeError::UnknownToken(index))
        }
        NIBBLE_8 => {
            cursor.pos += 1;
            let digit_count = cursor.read_u8()? as usize;
            let byte_count = digit_count.div_ceil(2);
            let packed = cursor.read_bytes(byte_count)?;
            let mut digits = String::with_capacity(digit_count);
            for (i, byte) in packed.iter().enumerate() {
                let high = byte >> 4;
                let low = byte & 0x0F;
                if i * 2 < digit_count {
                    digits.push((b'0' + high) as char);
                }
                if i * 2 + 1 < digit_count {
                    digits.push((b'0' + low) as char);
                }
            }
            Ok(digits)
        }
        DICTIONARY_0_BASE..=DICTIONARY_0_END => {
            cursor.pos += 1;
            dictionary_resolve(next, false)
                .map(str::to_owned)
                .ok_or(BinaryNodeError::UnknownToken(next))
        }
        BINARY_8 | BINARY_20 | BINARY_32 => {
            let bytes = decode_raw_bytes(cursor)?;
            String::from_utf8(bytes).map_err(|_| BinaryNodeError::InvalidUtf8)
        }
        other => Err(BinaryNodeError::UnknownToken(other)),
    }
}

fn decode_raw_bytes(cursor: &mut Cursor) -> Result<Vec<u8>> {
    let len = match cursor.read_u8()? {
        BINARY_8 => cursor.read_u8()? as usize,
        BINARY_20 => {
            let bytes = cursor.read_bytes(3)?;
            ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize
        }
        BINARY_32 => {
            let bytes = cursor.read_bytes(4)?;
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        }
        other => return Err(BinaryNodeError::UnknownToken(other)),
    };
    Ok(cursor.read_bytes(len)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_minimal_node() {
        let node = BinaryNode::new("ping");
        let encoded = encode(&node);
        assert_eq!(decode(&encoded).unwrap(), node);
    }

    #[test]
    fn round_trips_attr_bearing_iq_with_child() {
        let node = BinaryNode::new("iq")
            .with_attr("to", "s.whatsapp.net")
            .with_attr("type", "get")
            .with_attr("id", "abc.1")
            .with_attr("xmlns", "w:p")
            .with_children(vec![BinaryNode::new("ping")]);

        let encoded = encode(&node);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.attrs.get("to").unwrap(), "s.whatsapp.net");
        assert_eq!(decoded.child("ping").unwrap().tag, "ping");
    }

    #[test]
    fn round_trips_full_jid_value() {
        let node = BinaryNode::new("message").with_attr("to", "15551234567@s.whatsapp.net");
        let decoded = decode(&encode(&node)).unwrap();
        assert_eq!(decoded.attrs.get("to").unwrap(), "15551234567@s.whatsapp.net");
    }

    #[test]
    fn round_trips_byte_content() {
        let node = BinaryNode::new("message").with_bytes(vec![1, 2, 3, 4, 255, 0]);
        let decoded = decode(&encode(&node)).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn round_trips_large_binary_blob() {
        let payload = vec![0x42_u8; 70_000];
        let node = BinaryNode::new("message").with_bytes(payload.clone());
        let decoded = decode(&encode(&node)).unwrap();
        assert_eq!(decoded.content, Some(NodeContent::Bytes(payload)));
    }

    #[test]
    fn round_trips_nested_children() {
        let node = BinaryNode::new("iq").with_children(vec![
            BinaryNode::new("list").with_children(vec![
                BinaryNode::new("item").with_attr("id", "1"),
                BinaryNode::new("item").with_attr("id", "2"),
            ]),
        ]);
        let decoded = decode(&encode(&node)).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let node = BinaryNode::new("ping");
        let mut encoded = encode(&node);
        encoded.push(0xAA);
        assert!(matches!(decode(&encoded), Err(BinaryNodeError::UnknownToken(_)) | Err(BinaryNodeError::TrailingBytes)));
    }

    #[test]
    fn decode_rejects_unknown_token() {
        assert!(matches!(decode(&[0xDD]), Err(BinaryNodeError::UnknownToken(0xDD))));
    }

    #[test]
    fn digit_only_jid_local_uses_packed_nibble() {
        let node = BinaryNode::new("message").with_attr("participant", "5511999998888@s.whatsapp.net");
        let encoded = encode(&node);
        // The jid-pair's user component ("5511999998888") should have been
        // packed as nibbles, not emitted as a length-prefixed raw string.
        assert!(encoded.windows(1).any(|w| w[0] == NIBBLE_8));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(
            decoded.attrs.get("participant").unwrap(),
            "5511999998888@s.whatsapp.net"
        );
    }
}

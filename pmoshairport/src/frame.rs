//! Shairport metadata frame decoding
//!
//! Shairport-sync writes its metadata pipe as a sequence of XML items:
//!
//! ```text
//! <item><type>636f7265</type><code>6d696e6d</code><length>17</length>
//! <data encoding="base64">
//! Qm9oZW1pYW4gUmhhcHNvZHk=</data></item>
//! ```
//!
//! `type` and `code` are four ASCII characters, hex encoded. Only the
//! `core` category carries track information; its `minm`, `asar` and
//! `asal` codes are the title, artist and album.

use crate::track::{TrackField, TrackUpdate};
use base64::Engine;
use quick_xml::{events::Event, Error as XmlError, Reader};

/// Closing tag that ends a frame on the wire
pub const ITEM_CLOSE: &str = "</item>";

/// Category of the frames that describe the current track
pub const CORE: &str = "core";

#[derive(Debug, thiserror::Error)]
pub enum FrameParseError {
    #[error("XML error: {0}")]
    Xml(#[from] XmlError),

    #[error("root element is not <item>")]
    NotAnItem,

    #[error("frame ends before </item>")]
    Truncated,

    #[error("missing <{0}> element")]
    MissingElement(&'static str),

    #[error("invalid hex in <{element}>: {source}")]
    Hex {
        element: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A fully decoded metadata item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFrame {
    pub category: String,
    pub code: String,
    pub payload: Vec<u8>,
}

impl MetadataFrame {
    pub fn is_core(&self) -> bool {
        self.category == CORE
    }

    /// Payload as text, invalid UTF-8 replaced
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Track update carried by this frame, if any
    pub fn track_update(&self) -> Option<TrackUpdate> {
        if !self.is_core() {
            return None;
        }
        TrackField::from_code(&self.code).map(|field| TrackUpdate::new(field, self.payload_text()))
    }
}

#[derive(Debug)]
struct DataElement {
    text: String,
    base64: bool,
}

/// Element texts of an `<item>`, before any decoding
#[derive(Debug, Default)]
struct RawItem {
    kind: Option<String>,
    code: Option<String>,
    data: Option<DataElement>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Child {
    Type,
    Code,
    Data,
    Other,
}

impl Child {
    fn from_name(name: &[u8]) -> Self {
        match name {
            b"type" => Child::Type,
            b"code" => Child::Code,
            b"data" => Child::Data,
            _ => Child::Other,
        }
    }
}

impl RawItem {
    fn parse(xml: &str) -> Result<Self, FrameParseError> {
        let mut reader = Reader::from_str(xml);
        let mut item = RawItem::default();
        let mut in_item = false;
        let mut depth = 0usize;
        let mut current: Option<Child> = None;
        let mut text = String::new();
        let mut base64 = false;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    if !in_item {
                        if e.local_name().as_ref() != b"item" {
                            return Err(FrameParseError::NotAnItem);
                        }
                        in_item = true;
                        continue;
                    }
                    depth += 1;
                    if depth == 1 {
                        let child = Child::from_name(e.local_name().as_ref());
                        if child == Child::Data {
                            base64 = is_base64(&e)?;
                        }
                        current = Some(child);
                        text.clear();
                    }
                }
                Event::Empty(e) => {
                    if !in_item {
                        // <item/> carries nothing at all
                        return if e.local_name().as_ref() == b"item" {
                            Err(FrameParseError::MissingElement("type"))
                        } else {
                            Err(FrameParseError::NotAnItem)
                        };
                    }
                    if depth == 0 {
                        let child = Child::from_name(e.local_name().as_ref());
                        let b64 = child == Child::Data && is_base64(&e)?;
                        item.store(child, String::new(), b64);
                    }
                }
                Event::End(_) => {
                    if !in_item {
                        return Err(FrameParseError::NotAnItem);
                    }
                    if depth == 0 {
                        return Ok(item);
                    }
                    if depth == 1 {
                        if let Some(child) = current.take() {
                            item.store(child, std::mem::take(&mut text), base64);
                        }
                        base64 = false;
                    }
                    depth -= 1;
                }
                Event::Text(e) => {
                    if current.is_some() && depth == 1 {
                        text.push_str(&e.decode().map_err(XmlError::Encoding)?);
                    } else if !in_item && !e.decode().map_err(XmlError::Encoding)?.trim().is_empty() {
                        return Err(FrameParseError::NotAnItem);
                    }
                }
                Event::CData(e) => {
                    if current.is_some() && depth == 1 {
                        text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                    }
                }
                Event::GeneralRef(e) => {
                    if current.is_some() && depth == 1 {
                        let name = e.decode().map_err(XmlError::Encoding)?;
                        push_entity(&mut text, &name);
                    }
                }
                Event::Eof => {
                    return if in_item {
                        Err(FrameParseError::Truncated)
                    } else {
                        Err(FrameParseError::NotAnItem)
                    };
                }
                _ => {}
            }
        }
    }

    fn store(&mut self, child: Child, text: String, base64: bool) {
        match child {
            Child::Type => self.kind = Some(text),
            Child::Code => self.code = Some(text),
            Child::Data => self.data = Some(DataElement { text, base64 }),
            Child::Other => {}
        }
    }

    fn category(&self) -> Result<String, FrameParseError> {
        let hex = self
            .kind
            .as_deref()
            .ok_or(FrameParseError::MissingElement("type"))?;
        decode_hex_ascii("type", hex)
    }

    fn code(&self) -> Result<String, FrameParseError> {
        let hex = self
            .code
            .as_deref()
            .ok_or(FrameParseError::MissingElement("code"))?;
        decode_hex_ascii("code", hex)
    }

    fn payload(&self) -> Result<Vec<u8>, FrameParseError> {
        match &self.data {
            None => Ok(Vec::new()),
            Some(data) if data.base64 => {
                let compact: String = data.text.split_whitespace().collect();
                Ok(base64::engine::general_purpose::STANDARD.decode(compact)?)
            }
            Some(data) => Ok(data.text.clone().into_bytes()),
        }
    }
}

fn is_base64(e: &quick_xml::events::BytesStart<'_>) -> Result<bool, FrameParseError> {
    let attr = e
        .try_get_attribute("encoding")
        .map_err(XmlError::from)?;
    Ok(attr
        .map(|a| String::from_utf8_lossy(&a.value).eq_ignore_ascii_case("base64"))
        .unwrap_or(false))
}

fn push_entity(out: &mut String, name: &str) {
    if let Some(resolved) = quick_xml::escape::resolve_predefined_entity(name) {
        out.push_str(resolved);
        return;
    }
    let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(dec) = name.strip_prefix('#') {
        dec.parse::<u32>().ok()
    } else {
        None
    };
    match code.and_then(char::from_u32) {
        Some(c) => out.push(c),
        None => {
            // Unknown entity: keep it verbatim
            out.push('&');
            out.push_str(name);
            out.push(';');
        }
    }
}

fn decode_hex_ascii(element: &'static str, text: &str) -> Result<String, FrameParseError> {
    let compact: String = text.split_whitespace().collect();
    let bytes = hex::decode(compact).map_err(|source| FrameParseError::Hex { element, source })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Parses one complete `<item>…</item>` frame
pub fn parse_frame(xml: &str) -> Result<MetadataFrame, FrameParseError> {
    let raw = RawItem::parse(xml)?;
    Ok(MetadataFrame {
        category: raw.category()?,
        code: raw.code()?,
        payload: raw.payload()?,
    })
}

/// Decodes a frame straight to a track update
///
/// Non-`core` frames are discarded before their payload is looked at, so a
/// binary payload in another category (cover art, progress…) is never
/// decoded. Items without a `<data>` element carry no value and are skipped.
pub fn decode_track_update(xml: &str) -> Result<Option<TrackUpdate>, FrameParseError> {
    let raw = RawItem::parse(xml)?;
    if raw.category()? != CORE {
        return Ok(None);
    }
    let code = raw.code()?;
    if raw.data.is_none() {
        return Ok(None);
    }
    let payload = raw.payload()?;

    Ok(TrackField::from_code(&code)
        .map(|field| TrackUpdate::new(field, String::from_utf8_lossy(&payload).into_owned())))
}

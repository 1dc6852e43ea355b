//! Top-level element boundary detection on an open-ended XMPP byte stream.
//!
//! The stream header `<stream:stream ...>` is never closed until the end of
//! the session, so a regular XML parser would wait forever. Boundaries are
//! found with a depth counter over quick-xml events instead: the header is
//! returned as soon as its start tag is complete, and every element at depth
//! one is returned once its matching end tag arrives.

use quick_xml::errors::{Error as XmlError, SyntaxError};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::XmppError;

const STREAM_CLOSE: &[u8] = b"</stream:stream>";

/// One unit extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The stream header start tag, with any XML declaration before it.
    StreamOpen(String),
    /// A complete top-level element.
    Element(String),
    StreamClose,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Between elements, or before the stream header.
    Idle,
    /// Inside a top-level element.
    InElement,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_xml_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

/// Number of leading whitespace bytes (whitespace keepalives between elements).
pub fn leading_whitespace(buffer: &[u8]) -> usize {
    buffer.iter().take_while(|&&b| is_xml_whitespace(b)).count()
}

fn is_stream_tag(name: &[u8]) -> bool {
    name == b"stream:stream" || name == b"stream"
}

/// Extract one frame from the start of `buffer`.
///
/// Returns the frame and the number of bytes it consumed (leading whitespace
/// included), or `None` when the buffer does not hold a complete frame yet.
pub fn extract_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>, XmppError> {
    let start = leading_whitespace(buffer);
    if buffer[start..].starts_with(STREAM_CLOSE) {
        return Ok(Some((Frame::StreamClose, start + STREAM_CLOSE.len())));
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut element_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle && is_stream_tag(e.name().as_ref()) {
                    let tag_end = reader.buffer_position() as usize;
                    let header = bytes_to_string(&buffer[start..tag_end]);
                    return Ok(Some((Frame::StreamOpen(header), tag_end)));
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InElement;
                    element_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle && is_stream_tag(e.name().as_ref()) {
                    // A self-closed header opens and closes the stream at once
                    return Ok(Some((Frame::StreamClose, reader.buffer_position() as usize)));
                }

                // Self-closing top-level element, e.g. <presence/> or <r xmlns='urn:xmpp:sm:3'/>
                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    let element = bytes_to_string(&buffer[pos..tag_end]);
                    return Ok(Some((Frame::Element(element), tag_end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 && is_stream_tag(e.name().as_ref()) {
                    return Ok(Some((Frame::StreamClose, reader.buffer_position() as usize)));
                }

                depth = depth.saturating_sub(1);
                if state == ParserState::InElement && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    let element = bytes_to_string(&buffer[element_start..tag_end]);
                    return Ok(Some((Frame::Element(element), tag_end)));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            // Expected while streaming: the rest arrives with the next read
            Err(XmlError::Syntax(
                SyntaxError::UnclosedTag
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedDoctype
                | SyntaxError::UnclosedPIOrXmlDecl,
            )) => return Ok(None),
            Err(e) => return Err(XmppError::Xml(e.to_string())),
        }
    }
}

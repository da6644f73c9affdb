//! Line Protocol Codec
//!
//! Encoders return a complete frame, delimiter included, as [`Bytes`] so a
//! broadcast serializes once and hands the same buffer to every peer.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::constants::*;
use super::types::ServerFrame;

/// `USERNAME:<name>\n`
pub fn encode_handshake(name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_PREFIX.len() + name.len() + 1);
    buf.put_slice(HANDSHAKE_PREFIX.as_bytes());
    buf.put_slice(name.as_bytes());
    buf.put_u8(FRAME_DELIMITER);
    buf.freeze()
}

/// The rejection sent to a client whose first frame is not a handshake
pub fn encode_handshake_error() -> Bytes {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_ERROR.len() + 1);
    buf.put_slice(HANDSHAKE_ERROR.as_bytes());
    buf.put_u8(FRAME_DELIMITER);
    buf.freeze()
}

/// `[<sender>] <text>\n`
pub fn encode_chat(sender: &str, text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(sender.len() + text.len() + 4);
    buf.put_u8(b'[');
    buf.put_slice(sender.as_bytes());
    buf.put_slice(b"] ");
    buf.put_slice(text.as_bytes());
    buf.put_u8(FRAME_DELIMITER);
    buf.freeze()
}

/// `USERS:<a>,<b>,...\n`
pub fn encode_roster<'a, I>(names: I) -> Bytes
where
    I: IntoIterator<Item = &'a str>,
{
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(ROSTER_PREFIX.as_bytes());
    for (i, name) in names.into_iter().enumerate() {
        if i > 0 {
            buf.put_u8(ROSTER_SEPARATOR as u8);
        }
        buf.put_slice(name.as_bytes());
    }
    buf.put_u8(FRAME_DELIMITER);
    buf.freeze()
}

/// A line of user text as sent by a client
pub fn encode_outbound(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    buf.put_slice(text.as_bytes());
    buf.put_u8(FRAME_DELIMITER);
    buf.freeze()
}

/// Extract the display name from a handshake line.
///
/// Returns `None` when the line is not a handshake. An empty or blank name
/// is replaced with [`DEFAULT_DISPLAY_NAME`].
pub fn parse_handshake(line: &str) -> Option<String> {
    let name = line.trim().strip_prefix(HANDSHAKE_PREFIX)?.trim();
    if name.is_empty() {
        Some(DEFAULT_DISPLAY_NAME.to_string())
    } else {
        Some(name.to_string())
    }
}

/// Split a roster payload into names, dropping empty entries
pub fn parse_roster(payload: &str) -> Vec<String> {
    payload
        .split(ROSTER_SEPARATOR)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Classify a line received from the relay.
///
/// Chat frames split on the first `]`, so a sender name that itself contains
/// `]` is mis-split. Names are not escaped on the wire and the split is kept
/// as is for compatibility. Lines that are neither a roster nor contain `]`
/// yield `None`.
pub fn parse_server_frame(line: &str) -> Option<ServerFrame> {
    let line = line.trim();

    if let Some(payload) = line.strip_prefix(ROSTER_PREFIX) {
        return Some(ServerFrame::Roster(parse_roster(payload)));
    }

    let (head, rest) = line.split_once(']')?;
    let sender = head.strip_prefix('[').unwrap_or(head);
    let text = rest.strip_prefix(' ').unwrap_or(rest);

    Some(ServerFrame::Chat {
        sender: sender.to_string(),
        text: text.to_string(),
    })
}

/// Read one newline-terminated frame.
///
/// Bytes that are not valid UTF-8 are replaced with U+FFFD rather than
/// failing the read. Returns `None` at end of stream, including when the
/// stream ends on a fragment with no trailing delimiter; that fragment is
/// discarded.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    reader.read_until(FRAME_DELIMITER, buf).await?;

    if buf.last() != Some(&FRAME_DELIMITER) {
        return Ok(None);
    }

    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

use std::io::{Read, Write};
use uuid::Uuid;

use crate::{Message, NetError};

/// Frame terminator. JSON encoding escapes newlines inside strings, so a
/// raw `\n` only ever ends a frame.
pub const DELIMITER: u8 = b'\n';

/// Longest frame a reader buffers, delimiter included. A peer that exceeds
/// it is disconnected.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Write one message as a JSON line and flush.
pub fn write_frame<W: Write>(writer: &mut W, message: &Message) -> Result<(), NetError> {
    serde_json::to_writer(&mut *writer, message)?;
    writer.write_all(&[DELIMITER])?;
    writer.flush()?;
    Ok(())
}

/// Parse one frame, with or without its trailing delimiter.
pub fn decode_frame(frame: &[u8]) -> Result<Message, NetError> {
    let body = frame.strip_suffix(&[DELIMITER]).unwrap_or(frame);
    Ok(serde_json::from_slice(body)?)
}

/// Exchange identities over a fresh stream.
///
/// Writes `own` as 16 raw bytes plus the delimiter, then reads the peer's
/// identity in the same shape. The ID is read by length, so a `\n` byte
/// inside it is harmless.
pub fn handshake<S: Read + Write>(stream: &mut S, own: Uuid) -> Result<Uuid, NetError> {
    let mut hello = [0u8; 17];
    hello[..16].copy_from_slice(own.as_bytes());
    hello[16] = DELIMITER;
    stream.write_all(&hello)?;
    stream.flush()?;

    let mut peer = [0u8; 17];
    stream.read_exact(&mut peer)?;
    if peer[16] != DELIMITER {
        return Err(NetError::Handshake(format!(
            "expected delimiter after peer id, got byte {:#04x}",
            peer[16]
        )));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&peer[..16]);
    Ok(Uuid::from_bytes(id))
}

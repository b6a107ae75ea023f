//! Length-prefixed frame codec, blocking and async flavours.

use crate::{ProtocolError, ProtocolResult};
use serde_json::Value;
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use vat_codec::to_canonical_cbor;

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encode a tagged item list as a canonical CBOR payload.
pub fn encode_payload(items: &[Value]) -> ProtocolResult<Vec<u8>> {
    match items.first() {
        Some(Value::String(_)) => {}
        Some(other) => {
            return Err(ProtocolError::Malformed(format!(
                "frame tag must be text, got {other}"
            )));
        }
        None => return Err(ProtocolError::Malformed("empty frame".into())),
    }
    Ok(to_canonical_cbor(&items)?)
}

/// Decode a payload into its tag and remaining items.
pub fn decode_payload(bytes: &[u8]) -> ProtocolResult<(String, Vec<Value>)> {
    let value: Value = serde_cbor::from_slice(bytes)
        .map_err(|e| ProtocolError::Malformed(format!("undecodable payload: {e}")))?;
    let Value::Array(mut items) = value else {
        return Err(ProtocolError::Malformed("payload is not an array".into()));
    };
    if items.is_empty() {
        return Err(ProtocolError::Malformed("empty frame".into()));
    }
    match items.remove(0) {
        Value::String(tag) => Ok((tag, items)),
        other => Err(ProtocolError::Malformed(format!(
            "frame tag must be text, got {other}"
        ))),
    }
}

fn check_len(len: usize) -> ProtocolResult<()> {
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(())
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut off = 0usize;
    while off < buf.len() {
        let n = reader.read(&mut buf[off..])?;
        if n == 0 {
            if off == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF inside frame header",
            ));
        }
        off += n;
    }
    Ok(true)
}

/// Read one frame; `None` on a clean end of stream.
pub fn read_frame(reader: &mut impl Read) -> ProtocolResult<Option<Vec<u8>>> {
    let mut hdr = [0u8; 4];
    if !read_exact_or_eof(reader, &mut hdr)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(hdr) as usize;
    check_len(len)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> ProtocolResult<()> {
    check_len(payload.len())?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub async fn read_frame_async<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> ProtocolResult<Option<Vec<u8>>> {
    let mut hdr = [0u8; 4];
    let mut off = 0usize;
    while off < hdr.len() {
        let n = reader.read(&mut hdr[off..]).await?;
        if n == 0 {
            if off == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF inside frame header",
            )
            .into());
        }
        off += n;
    }
    let len = u32::from_le_bytes(hdr) as usize;
    check_len(len)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame_async<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    payload: &[u8],
) -> ProtocolResult<()> {
    check_len(payload.len())?;
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

use std::{
    io,
    sync::atomic::{AtomicI32, Ordering},
};

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{header::Header, message::DEFAULT_MAX_MESSAGE_SIZE_BYTES};
use crate::{
    bson::{decode_document_prefix, Document},
    error::{Error, Result},
};

/// Obtain a new, unique request ID.
pub(crate) fn next_request_id() -> i32 {
    static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Reads one length-prefixed frame: the header followed by the remaining `length - 16` bytes.
/// Frames claiming to be shorter than a header or longer than `max_message_size_bytes` are
/// rejected before any of the body is read. An over-long frame is an I/O error, like a stream
/// that ends early.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_size_bytes: Option<i32>,
) -> Result<(Header, Vec<u8>)> {
    let header = Header::read_from(reader).await?;
    let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
    if header.length > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message length {} over maximum {}", header.length, max_len),
        )
        .into());
    }
    let body_len = usize::try_from(header.length)
        .ok()
        .and_then(|len| len.checked_sub(Header::LENGTH))
        .ok_or_else(|| {
            Error::invalid_response(format!("Message length {} is too short", header.length))
        })?;

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

/// A cursor over a message body that has already been read into memory.
pub(super) struct SliceReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub(super) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(super) fn position(&self) -> usize {
        self.pos
    }

    pub(super) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::invalid_response(format!(
                "message ended after {} bytes, expected at least {} more",
                self.pos, n
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    pub(super) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(super) fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub(super) fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub(super) fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub(super) fn read_cstring(&mut self) -> Result<String> {
        let rest = &self.bytes[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::invalid_response("unterminated cstring in message"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| Error::invalid_response(format!("invalid UTF-8 in message: {e}")))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    pub(super) fn read_document(&mut self) -> Result<Document> {
        let (document, len) = decode_document_prefix(&self.bytes[self.pos..])?;
        self.pos += len;
        Ok(document)
    }
}

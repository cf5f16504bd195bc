use bitflags::bitflags;
use tokio::io::AsyncRead;

use super::{
    header::{Header, OpCode},
    util::{read_frame, SliceReader},
};
use crate::{
    bson::Document,
    error::{Error, Result},
};

bitflags! {
    /// Represents the bitwise flags for an OP_REPLY.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ResponseFlags: u32 {
        const CURSOR_NOT_FOUND = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const QUERY_FAILURE    = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const AWAIT_CAPABLE    = 0b_0000_0000_0000_0000_0000_0000_0000_1000;
    }
}

/// Represents a wire protocol OP_REPLY operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reply {
    pub(crate) response_to: i32,
    pub(crate) response_flags: ResponseFlags,
    pub(crate) cursor_id: i64,
    pub(crate) starting_from: i32,
    pub(crate) docs: Vec<Document>,
}

impl Reply {
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let (header, body) = read_frame(reader, max_message_size_bytes).await?;
        if header.op_code != OpCode::Reply {
            return Err(Error::invalid_response(format!(
                "Invalid op code, expected {} and got {}",
                OpCode::Reply as i32,
                header.op_code as i32
            )));
        }
        Self::parse(&header, &body)
    }

    pub(crate) fn parse(header: &Header, body: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(body);
        let response_flags = ResponseFlags::from_bits_truncate(reader.read_u32()?);
        let cursor_id = reader.read_i64()?;
        let starting_from = reader.read_i32()?;
        let num_returned = reader.read_i32()?;

        let mut docs = Vec::new();
        while reader.remaining() > 0 {
            docs.push(reader.read_document()?);
        }

        if usize::try_from(num_returned).ok() != Some(docs.len()) {
            return Err(Error::invalid_response(format!(
                "OP_REPLY announced {num_returned} documents but contained {}",
                docs.len()
            )));
        }

        Ok(Self {
            response_to: header.response_to,
            response_flags,
            cursor_id,
            starting_from,
            docs,
        })
    }

    /// The single command reply document carried by this OP_REPLY. A `QueryFailure` flag is
    /// surfaced as a command error built from the `$err` document.
    pub(crate) fn into_command_document(self) -> Result<Document> {
        let failed = self.response_flags.contains(ResponseFlags::QUERY_FAILURE);
        let mut doc = self
            .docs
            .into_iter()
            .next()
            .ok_or_else(|| Error::invalid_response("OP_REPLY contained no documents"))?;
        if failed {
            let message = doc.get_str("$err").unwrap_or("query failure").to_string();
            doc.insert("ok", 0);
            if !doc.contains_key("errmsg") {
                doc.insert("errmsg", message);
            }
        }
        Ok(doc)
    }

    #[cfg(test)]
    pub(crate) async fn write_to<W: tokio::io::AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        request_id: i32,
    ) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut bytes = vec![0u8; Header::LENGTH];
        bytes.extend_from_slice(&self.response_flags.bits().to_le_bytes());
        bytes.extend_from_slice(&self.cursor_id.to_le_bytes());
        bytes.extend_from_slice(&self.starting_from.to_le_bytes());
        let num_returned = i32::try_from(self.docs.len())
            .map_err(|_| Error::internal("too many documents in reply"))?;
        bytes.extend_from_slice(&num_returned.to_le_bytes());
        for doc in &self.docs {
            crate::bson::encode_document_into(doc, &mut bytes)?;
        }
        let header = Header {
            length: i32::try_from(bytes.len())
                .map_err(|_| Error::internal("reply is too large"))?,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Reply,
        };
        bytes[..Header::LENGTH].copy_from_slice(&header.to_bytes());
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

use bitflags::bitflags;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    next_request_id,
};
use crate::{
    bson::{encode_document_into, Document},
    error::{Error, Result},
};

bitflags! {
    /// Represents the bitwise flags for an OP_QUERY.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct QueryFlags: u32 {
        const TAILABLE_CURSOR   = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const SECONDARY_OK      = 0b_0000_0000_0000_0000_0000_0000_0000_0100;
        const NO_CURSOR_TIMEOUT = 0b_0000_0000_0000_0000_0000_0000_0001_0000;
        const AWAIT_DATA        = 0b_0000_0000_0000_0000_0000_0000_0010_0000;
        const EXHAUST           = 0b_0000_0000_0000_0000_0000_0000_0100_0000;
        const PARTIAL           = 0b_0000_0000_0000_0000_0000_0000_1000_0000;
    }
}

/// Represents a legacy OP_QUERY. Only used to run commands against `<db>.$cmd` before a server
/// has announced OP_MSG support.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Query {
    pub(crate) flags: QueryFlags,
    pub(crate) full_collection_name: String,
    pub(crate) number_to_skip: i32,
    pub(crate) number_to_return: i32,
    pub(crate) query: Document,
    pub(crate) request_id: Option<i32>,
}

impl Query {
    /// A command sent as a query against the `$cmd` pseudo-collection of `db`.
    pub(crate) fn command(db: &str, command: Document, request_id: Option<i32>) -> Self {
        Self {
            flags: QueryFlags::SECONDARY_OK,
            full_collection_name: format!("{db}.$cmd"),
            number_to_skip: 0,
            number_to_return: -1,
            query: command,
            request_id,
        }
    }

    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut bytes = vec![0u8; Header::LENGTH];
        bytes.extend_from_slice(&self.flags.bits().to_le_bytes());
        bytes.extend_from_slice(self.full_collection_name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&self.number_to_skip.to_le_bytes());
        bytes.extend_from_slice(&self.number_to_return.to_le_bytes());
        encode_document_into(&self.query, &mut bytes)?;

        let header = Header {
            length: i32::try_from(bytes.len())
                .map_err(|_| Error::invalid_argument("query message is too large"))?,
            request_id: self.request_id.unwrap_or_else(next_request_id),
            response_to: 0,
            op_code: OpCode::Query,
        };
        bytes[..Header::LENGTH].copy_from_slice(&header.to_bytes());

        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Parses the body of an OP_QUERY whose header has already been read.
    #[cfg(test)]
    pub(crate) fn parse(header: &Header, body: &[u8]) -> Result<Self> {
        let mut reader = super::util::SliceReader::new(body);
        let flags = QueryFlags::from_bits_truncate(reader.read_u32()?);
        let full_collection_name = reader.read_cstring()?;
        let number_to_skip = reader.read_i32()?;
        let number_to_return = reader.read_i32()?;
        let query = reader.read_document()?;
        Ok(Self {
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            request_id: Some(header.request_id),
        })
    }
}

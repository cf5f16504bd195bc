use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    next_request_id,
    util::{read_frame, SliceReader},
};
use crate::{
    bson::{encode_document_into, Document},
    cmap::Command,
    error::{Error, ErrorKind, Result},
};

pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48_000_000;

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Message {
    // OP_MSG payload type 0
    pub(crate) document_payload: Document,
    // OP_MSG payload type 1
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Document>,
}

impl Message {
    /// Creates a `Message` from a given `Command`. Note that the `response_to` field must be set
    /// manually.
    pub(crate) fn from_command(command: &Command, request_id: Option<i32>) -> Self {
        let mut flags = MessageFlags::empty();
        if command.exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }
        if command.more_to_come {
            flags |= MessageFlags::MORE_TO_COME;
        }

        Self {
            document_payload: command.to_document(),
            document_sequences: command.document_sequences.clone(),
            response_to: 0,
            flags,
            checksum: None,
            request_id,
        }
    }

    /// A single-section reply to `request_id`. Used by servers, and by the in-process test
    /// server.
    #[cfg(test)]
    pub(crate) fn reply_to(request_id: i32, document_payload: Document) -> Self {
        Self {
            document_payload,
            document_sequences: Vec::new(),
            response_to: request_id,
            flags: MessageFlags::empty(),
            checksum: None,
            request_id: None,
        }
    }

    /// Gets this message's command as a single document, with each document sequence folded in
    /// as an array field.
    #[cfg(test)]
    pub(crate) fn get_command_document(&self) -> Document {
        let mut command = self.document_payload.clone();
        for document_sequence in &self.document_sequences {
            let documents: crate::bson::Array = document_sequence
                .documents
                .iter()
                .cloned()
                .map(Into::into)
                .collect();
            command.insert(document_sequence.identifier.clone(), documents);
        }
        command
    }

    /// Reads bytes from `reader` and deserializes them into a Message.
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let (header, body) = read_frame(reader, max_message_size_bytes).await?;
        if header.op_code != OpCode::Message {
            return Err(Error::invalid_response(format!(
                "Invalid op code, expected {} and got {}",
                OpCode::Message as i32,
                header.op_code as i32
            )));
        }
        Self::parse(&header, &body)
    }

    /// Parses the body of an OP_MSG whose header has already been read.
    pub(crate) fn parse(header: &Header, body: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(body);
        let raw_flags = reader.read_u32()?;
        let unknown_required = raw_flags & REQUIRED_BITS_MASK & !MessageFlags::all().bits();
        if unknown_required != 0 {
            return Err(Error::invalid_response(format!(
                "OP_MSG has unsupported required flag bits set: {unknown_required:#x}"
            )));
        }
        let flags = MessageFlags::from_bits_truncate(raw_flags);

        let checksum_len = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            std::mem::size_of::<u32>()
        } else {
            0
        };
        let sections_end = body.len().checked_sub(checksum_len).ok_or_else(|| {
            Error::invalid_response("OP_MSG is too short to contain its checksum")
        })?;

        let mut document_payload = None;
        let mut document_sequences = Vec::new();
        while reader.position() < sections_end {
            match MessageSection::read(&mut reader)? {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(ErrorKind::InvalidResponse {
                            message: "an OP_MSG response must contain exactly one payload type 0 \
                                      section"
                                .into(),
                        }
                        .into());
                    }
                    document_payload = Some(document);
                }
                MessageSection::Sequence(document_sequence) => {
                    document_sequences.push(document_sequence)
                }
            }
        }

        if reader.position() != sections_end {
            return Err(Error::invalid_response(format!(
                "The server indicated that the reply would be {} bytes long, but it instead was {}",
                header.length,
                Header::LENGTH + reader.position() + checksum_len,
            )));
        }

        let checksum = if checksum_len > 0 {
            Some(reader.read_u32()?)
        } else {
            None
        };

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload: document_payload.ok_or_else(|| ErrorKind::InvalidResponse {
                message: "an OP_MSG response must contain exactly one payload type 0 section"
                    .into(),
            })?,
            document_sequences,
            checksum,
            request_id: Some(header.request_id),
        })
    }

    /// Serializes the Message to bytes and writes them to `writer`. Nothing is written if the
    /// message cannot be encoded or would exceed `max_message_size_bytes`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        max_message_size_bytes: Option<i32>,
    ) -> Result<()> {
        let bytes = self.to_bytes(max_message_size_bytes)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn to_bytes(&self, max_message_size_bytes: Option<i32>) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; Header::LENGTH];
        bytes.extend_from_slice(&self.flags.bits().to_le_bytes());

        // Payload type 0
        bytes.push(0);
        encode_document_into(&self.document_payload, &mut bytes)?;

        for document_sequence in &self.document_sequences {
            // Payload type 1
            bytes.push(1);
            let size_at = bytes.len();
            bytes.extend_from_slice(&[0u8; 4]);
            bytes.extend_from_slice(document_sequence.identifier.as_bytes());
            bytes.push(0);
            for document in &document_sequence.documents {
                encode_document_into(document, &mut bytes)?;
            }
            let size = i32::try_from(bytes.len() - size_at)
                .map_err(|_| Error::invalid_argument("document sequence is too large"))?;
            bytes[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());
        }

        if let Some(checksum) = self.checksum {
            bytes.extend_from_slice(&checksum.to_le_bytes());
        }

        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        let length = i32::try_from(bytes.len())
            .ok()
            .filter(|len| *len <= max_len)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "message of {} bytes exceeds the maximum message size of {max_len} bytes",
                    bytes.len()
                ))
            })?;

        let header = Header {
            length,
            request_id: self.request_id.unwrap_or_else(next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };
        bytes[..Header::LENGTH].copy_from_slice(&header.to_bytes());
        Ok(bytes)
    }
}

/// Bits 0-15 of the OP_MSG flags are required: a peer must reject a message with any of them set
/// that it does not understand.
const REQUIRED_BITS_MASK: u32 = 0xffff;

bitflags! {
    /// Represents the bitwise flags for an OP_MSG.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents a section of an OP_MSG.
#[derive(Debug)]
enum MessageSection {
    Document(Document),
    Sequence(DocumentSequence),
}

impl MessageSection {
    fn read(reader: &mut SliceReader<'_>) -> Result<Self> {
        let payload_type = reader.read_u8()?;

        match payload_type {
            0 => Ok(MessageSection::Document(reader.read_document()?)),
            1 => {
                let start = reader.position();
                let size = usize::try_from(reader.read_i32()?).map_err(|_| {
                    Error::invalid_response("negative document sequence size in OP_MSG")
                })?;
                let end = start + size;
                let identifier = reader.read_cstring()?;

                let mut documents = Vec::new();
                while reader.position() < end {
                    documents.push(reader.read_document()?);
                }
                if reader.position() != end {
                    return Err(Error::invalid_response(format!(
                        "document sequence {identifier:?} overran its declared size of {size}"
                    )));
                }

                Ok(MessageSection::Sequence(DocumentSequence {
                    identifier,
                    documents,
                }))
            }
            other => Err(Error::invalid_response(format!(
                "invalid OP_MSG section payload type {other}"
            ))),
        }
    }
}

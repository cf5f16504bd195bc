use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, ErrorKind, Result};

/// Message kinds this crate sends or accepts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub(crate) enum OpCode {
    Reply = 1,
    Query = 2004,
    Message = 2013,
}

impl TryFrom<i32> for OpCode {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        [Self::Reply, Self::Query, Self::Message]
            .into_iter()
            .find(|op_code| *op_code as i32 == code)
            .ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: format!("unsupported opcode {code} in message header"),
                }
                .into()
            })
    }
}

/// The sixteen bytes that start every message, all little-endian `i32`s. `length` counts the
/// header itself.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 16;

    pub(crate) fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let fields = [
            self.length,
            self.request_id,
            self.response_to,
            self.op_code as i32,
        ];
        let mut bytes = [0u8; Self::LENGTH];
        for (chunk, field) in bytes.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    /// Fails on I/O errors and on opcodes other than the three above.
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut fields = [0i32; 4];
        for field in &mut fields {
            *field = reader.read_i32_le().await?;
        }
        let [length, request_id, response_to, op_code] = fields;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code: OpCode::try_from(op_code)?,
        })
    }
}

//! ObjectId generation and formatting.

use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU32, Ordering},
        LazyLock,
    },
    time::SystemTime,
};

use rand::Rng;

use crate::error::{Error, ErrorKind, Result};

const TIMESTAMP_SIZE: usize = 4;
const PROCESS_ID_SIZE: usize = 5;
const COUNTER_SIZE: usize = 3;

const TIMESTAMP_OFFSET: usize = 0;
const PROCESS_ID_OFFSET: usize = TIMESTAMP_OFFSET + TIMESTAMP_SIZE;
const COUNTER_OFFSET: usize = PROCESS_ID_OFFSET + PROCESS_ID_SIZE;

const MAX_U24: u32 = 0xFF_FFFF;

static OID_COUNTER: LazyLock<AtomicU32> =
    LazyLock::new(|| AtomicU32::new(rand::rng().random_range(0..=MAX_U24)));

static PROCESS_UNIQUE: LazyLock<[u8; PROCESS_ID_SIZE]> = LazyLock::new(|| rand::rng().random());

/// A 12-byte unique identifier: a big-endian creation timestamp, a per-process random value,
/// and a big-endian counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    id: [u8; 12],
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectId {
    /// A fresh id, unique to this process and moment.
    pub fn new() -> ObjectId {
        let timestamp = ObjectId::gen_timestamp();
        let process_id = *PROCESS_UNIQUE;
        let counter = ObjectId::gen_count();

        let mut buf: [u8; 12] = [0; 12];
        buf[TIMESTAMP_OFFSET..(TIMESTAMP_SIZE + TIMESTAMP_OFFSET)].copy_from_slice(&timestamp);
        buf[PROCESS_ID_OFFSET..(PROCESS_ID_SIZE + PROCESS_ID_OFFSET)].copy_from_slice(&process_id);
        buf[COUNTER_OFFSET..(COUNTER_SIZE + COUNTER_OFFSET)].copy_from_slice(&counter);

        ObjectId::from_bytes(buf)
    }

    /// Wraps raw id bytes.
    pub const fn from_bytes(bytes: [u8; 12]) -> ObjectId {
        ObjectId { id: bytes }
    }

    /// Parses 24 hex digits.
    pub fn parse_str(s: impl AsRef<str>) -> Result<ObjectId> {
        let s = s.as_ref();
        let bytes: Vec<u8> = hex::decode(s).map_err(|e| ErrorKind::InvalidArgument {
            message: format!("invalid ObjectId hex string {s:?}: {e}"),
        })?;
        let id: [u8; 12] = bytes.try_into().map_err(|_| {
            Error::invalid_argument(format!("ObjectId hex string {s:?} must be 24 characters"))
        })?;
        Ok(ObjectId::from_bytes(id))
    }

    /// Seconds since the epoch at which this id was generated.
    pub fn timestamp_secs(&self) -> u32 {
        let mut buf = [0; 4];
        buf.copy_from_slice(&self.id[TIMESTAMP_OFFSET..TIMESTAMP_SIZE]);
        u32::from_be_bytes(buf)
    }

    /// The raw 12 bytes.
    pub const fn bytes(&self) -> [u8; 12] {
        self.id
    }

    /// Lowercase hex, 24 characters.
    pub fn to_hex(self) -> String {
        hex::encode(self.id)
    }

    fn gen_timestamp() -> [u8; 4] {
        let timestamp: u32 = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        timestamp.to_be_bytes()
    }

    fn gen_count() -> [u8; 3] {
        let u_counter = OID_COUNTER.fetch_add(1, Ordering::SeqCst);
        let u_int = u_counter % (MAX_U24 + 1);
        let buf = u_int.to_be_bytes();
        [buf[1], buf[2], buf[3]]
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectId").field(&self.to_hex()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::ObjectId;

    #[test]
    fn counter_increases() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
        assert_eq!(a.bytes()[4..9], b.bytes()[4..9]);
    }

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::parse_str("53e37d08776f724e42000000").unwrap();
        assert_eq!(id.to_hex(), "53e37d08776f724e42000000");
        assert_eq!(id.timestamp_secs(), 0x53e37d08);
        assert!(ObjectId::parse_str("53e37d08").is_err());
        assert!(ObjectId::parse_str("zz").is_err());
    }
}

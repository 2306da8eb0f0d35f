//! Journal frame encoding.

use crate::error::{JournalError, JournalResult};
use txmesh_protocol::{from_cbor, to_cbor, JournalRecord};

/// Magic bytes identifying a journal frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"TXJL";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4) = 11 bytes
pub const HEADER_SIZE: usize = 11;

/// CRC size.
pub(crate) const CRC_SIZE: usize = 4;

/// Type byte of a journal frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// A committed transaction.
    Committed = 1,
    /// A rolled back transaction.
    RolledBack = 2,
}

impl FrameType {
    /// Converts a byte to a frame type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Committed),
            2 => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Returns the frame type of a record.
    #[must_use]
    pub fn of(record: &JournalRecord) -> Self {
        match record {
            JournalRecord::Committed(_) => Self::Committed,
            JournalRecord::RolledBack { .. } => Self::RolledBack,
        }
    }

    /// Converts the frame type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Human-readable name, used by tooling.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }
}

/// Encodes a record into a complete frame.
///
/// # Errors
///
/// Returns an error if the record cannot be encoded or its payload exceeds
/// the 4-byte length field.
pub fn encode_frame(record: &JournalRecord) -> JournalResult<Vec<u8>> {
    let payload = to_cbor(record)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| JournalError::corruption("journal record payload too large"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&JOURNAL_MAGIC);
    data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    data.push(FrameType::of(record).as_byte());
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&payload);

    // CRC32 over header + payload
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());

    Ok(data)
}

/// Decodes a frame payload and checks it against the frame type byte.
///
/// # Errors
///
/// Returns a corruption error if the payload does not decode or does not
/// match the frame type.
pub fn decode_frame(frame_type: FrameType, payload: &[u8]) -> JournalResult<JournalRecord> {
    let record: JournalRecord = from_cbor(payload)
        .map_err(|e| JournalError::corruption(format!("undecodable payload: {e}")))?;

    if FrameType::of(&record) != frame_type {
        return Err(JournalError::corruption(format!(
            "frame type {} does not match payload",
            frame_type.name()
        )));
    }

    Ok(record)
}

/// Computes a CRC32 checksum (IEEE polynomial).
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

use std::str;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const MAGIC: &[u8] = b"REDIS";
pub const RDB_VERSION: u32 = 11;
pub const REDIS_VER: &str = "redis-ver";
pub const REDIS_VER_VALUE: &str = "7.2.0";

pub const AUX: u8 = 0xFA;
pub const RESIZE_DB: u8 = 0xFB;
pub const EXPIRE_TIME_MS: u8 = 0xFC;
pub const EXPIRE_TIME: u8 = 0xFD;
pub const SELECT_DB: u8 = 0xFE;
pub const EOF: u8 = 0xFF;
pub const STRING_TYPE: u8 = 0x00;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RdbError {
    #[error("Header parse error")]
    Header,

    #[error("unexpected end of snapshot")]
    UnexpectedEof,

    #[error("unsupported value type {0:#04x}")]
    UnsupportedType(u8),

    #[error("unsupported string encoding {0:#04x}")]
    UnsupportedEncoding(u8),

    #[error("Can not parse data as integer")]
    NotANumber,
}

/// One key as carried inside a snapshot. Expiry is an absolute unix time in
/// milliseconds so it survives the trip to another process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub expires_at_ms: Option<u64>,
}

/// Producer and consumer of the opaque full-resync payload.
pub trait SnapshotCodec: Send + Sync + std::fmt::Debug {
    fn encode(&self, entries: &[SnapshotEntry]) -> Bytes;

    fn decode(&self, input: &[u8]) -> Result<Vec<SnapshotEntry>, RdbError>;
}

/// String-only RDB (version 11) files.
#[derive(Debug, Default, Clone, Copy)]
pub struct Rdb;

impl SnapshotCodec for Rdb {
    fn encode(&self, entries: &[SnapshotEntry]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_slice(format!("{RDB_VERSION:04}").as_bytes());

        buf.put_u8(AUX);
        put_string(&mut buf, REDIS_VER.as_bytes());
        put_string(&mut buf, REDIS_VER_VALUE.as_bytes());
        buf.put_u8(AUX);
        put_string(&mut buf, b"redis-bits");
        put_string(&mut buf, b"64");

        buf.put_u8(SELECT_DB);
        put_length(&mut buf, 0);
        buf.put_u8(RESIZE_DB);
        put_length(&mut buf, entries.len() as u64);
        put_length(
            &mut buf,
            entries.iter().filter(|e| e.expires_at_ms.is_some()).count() as u64,
        );

        for entry in entries {
            if let Some(at) = entry.expires_at_ms {
                buf.put_u8(EXPIRE_TIME_MS);
                buf.put_u64_le(at);
            }
            buf.put_u8(STRING_TYPE);
            put_string(&mut buf, &entry.key);
            put_string(&mut buf, &entry.value);
        }

        buf.put_u8(EOF);
        // Checksum disabled.
        buf.put_u64_le(0);
        buf.freeze()
    }

    fn decode(&self, input: &[u8]) -> Result<Vec<SnapshotEntry>, RdbError> {
        let mut reader = Reader { input, pos: 0 };
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(RdbError::Header);
        }
        str::from_utf8(reader.take(4)?)
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or(RdbError::Header)?;

        let mut entries = vec![];
        let mut expires_at_ms = None;
        loop {
            match reader.byte()? {
                EOF => break,
                AUX => {
                    reader.string()?;
                    reader.string()?;
                }
                SELECT_DB => {
                    reader.length()?;
                }
                RESIZE_DB => {
                    reader.length()?;
                    reader.length()?;
                }
                EXPIRE_TIME_MS => {
                    let raw = reader.take(8)?;
                    expires_at_ms = Some(u64::from_le_bytes(
                        raw.try_into().map_err(|_| RdbError::UnexpectedEof)?,
                    ));
                }
                EXPIRE_TIME => {
                    let raw = reader.take(4)?;
                    let secs =
                        u32::from_le_bytes(raw.try_into().map_err(|_| RdbError::UnexpectedEof)?);
                    expires_at_ms = Some(u64::from(secs) * 1000);
                }
                STRING_TYPE => {
                    let key = reader.string()?;
                    let value = reader.string()?;
                    entries.push(SnapshotEntry {
                        key,
                        value,
                        expires_at_ms: expires_at_ms.take(),
                    });
                }
                other => return Err(RdbError::UnsupportedType(other)),
            }
        }
        Ok(entries)
    }
}

fn put_length(buf: &mut BytesMut, len: u64) {
    if len < 1 << 6 {
        buf.put_u8(len as u8);
    } else if len < 1 << 14 {
        buf.put_u16(0x4000 | len as u16);
    } else if len <= u64::from(u32::MAX) {
        buf.put_u8(0x80);
        buf.put_u32(len as u32);
    } else {
        buf.put_u8(0x81);
        buf.put_u64(len);
    }
}

fn put_string(buf: &mut BytesMut, s: &[u8]) {
    put_length(buf, s.len() as u64);
    buf.put_slice(s);
}

enum Length {
    Plain(u64),
    Encoded(u8),
}

struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], RdbError> {
        let end = self.pos.checked_add(n).ok_or(RdbError::UnexpectedEof)?;
        let slice = self.input.get(self.pos..end).ok_or(RdbError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, RdbError> {
        Ok(self.take(1)?[0])
    }

    fn raw_length(&mut self) -> Result<Length, RdbError> {
        let first = self.byte()?;
        let len = match first >> 6 {
            0 => u64::from(first & 0x3F),
            1 => u64::from(u16::from_be_bytes([first & 0x3F, self.byte()?])),
            2 => match first {
                0x80 => u64::from(u32::from_be_bytes(
                    self.take(4)?.try_into().map_err(|_| RdbError::UnexpectedEof)?,
                )),
                0x81 => u64::from_be_bytes(
                    self.take(8)?.try_into().map_err(|_| RdbError::UnexpectedEof)?,
                ),
                other => return Err(RdbError::UnsupportedEncoding(other)),
            },
            _ => return Ok(Length::Encoded(first & 0x3F)),
        };
        Ok(Length::Plain(len))
    }

    fn length(&mut self) -> Result<u64, RdbError> {
        match self.raw_length()? {
            Length::Plain(len) => Ok(len),
            Length::Encoded(kind) => Err(RdbError::UnsupportedEncoding(0xC0 | kind)),
        }
    }

    fn string(&mut self) -> Result<Bytes, RdbError> {
        match self.raw_length()? {
            Length::Plain(len) => {
                let len = usize::try_from(len).map_err(|_| RdbError::NotANumber)?;
                Ok(Bytes::copy_from_slice(self.take(len)?))
            }
            // Integers stored as strings, little-endian.
            Length::Encoded(0) => Ok(Bytes::from((self.byte()? as i8).to_string())),
            Length::Encoded(1) => {
                let raw = self.take(2)?;
                Ok(Bytes::from(i16::from_le_bytes([raw[0], raw[1]]).to_string()))
            }
            Length::Encoded(2) => {
                let raw = self.take(4)?;
                Ok(Bytes::from(
                    i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string(),
                ))
            }
            Length::Encoded(kind) => Err(RdbError::UnsupportedEncoding(0xC0 | kind)),
        }
    }
}

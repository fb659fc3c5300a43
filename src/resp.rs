use std::io::Write;
use std::str::{from_utf8, Utf8Error};

use bytes::Bytes;
use thiserror::Error;

pub const CTRLF: &[u8] = b"\r\n";

/// Largest bulk string we accept, same ceiling as redis' `proto-max-bulk-len`.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Longest type/length header line accepted before its CRLF.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Requests are a flat array; replies nest at most a couple of levels.
pub const MAX_DEPTH: usize = 8;

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Resp {
    SimpleString(String),
    SimpleError(String),
    Integer(i64),
    BulkString(Bytes),
    Array(Vec<Resp>),
    Null,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RespError {
    #[error("Can not parse data as UTF-8")]
    UtfError(#[from] Utf8Error),

    #[error("Encountered unsuported type: {0:?}")]
    UnsuportedType(char),

    #[error("Can not parse data as integer")]
    NotAnInteger,

    #[error("invalid length {0}")]
    InvalidLength(i64),

    #[error("Data is not terminated with CTRLF")]
    NoCtrlf,

    #[error("header line too long")]
    LineTooLong,

    #[error("arrays nested too deeply")]
    TooDeep,
}

/// Result of a decode attempt: `None` means more bytes are required.
pub type Decoded<T> = Result<Option<(T, usize)>, RespError>;

impl Resp {
    /// Decodes one frame from the front of `input`, returning it together with
    /// the number of bytes it occupied. Bytes past that count are untouched and
    /// belong to the next frame.
    pub fn decode(input: &[u8]) -> Decoded<Self> {
        Self::decode_nested(input, 0)
    }

    fn decode_nested(input: &[u8], depth: usize) -> Decoded<Self> {
        let Some(&marker) = input.first() else {
            return Ok(None);
        };
        let Some((line, mut pos)) = read_line(input, 1)? else {
            return Ok(None);
        };
        let frame = match marker {
            b'+' => Resp::SimpleString(from_utf8(line)?.to_owned()),
            b'-' => Resp::SimpleError(from_utf8(line)?.to_owned()),
            b':' => Resp::Integer(parse_integer(line)?),
            b'$' => {
                let len = parse_integer(line)?;
                if len == -1 {
                    return Ok(Some((Resp::Null, pos)));
                }
                let len = checked_len(len)?;
                if input.len() < pos + len + CTRLF.len() {
                    return Ok(None);
                }
                let data = Bytes::copy_from_slice(&input[pos..pos + len]);
                pos += len;
                if &input[pos..pos + CTRLF.len()] != CTRLF {
                    return Err(RespError::NoCtrlf);
                }
                pos += CTRLF.len();
                Resp::BulkString(data)
            }
            b'*' => {
                let count = parse_integer(line)?;
                if count == -1 {
                    return Ok(Some((Resp::Null, pos)));
                }
                let count = checked_len(count)?;
                if count > 0 && depth >= MAX_DEPTH {
                    return Err(RespError::TooDeep);
                }
                let mut array = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    match Self::decode_nested(&input[pos..], depth + 1)? {
                        Some((item, used)) => {
                            array.push(item);
                            pos += used;
                        }
                        None => return Ok(None),
                    }
                }
                Resp::Array(array)
            }
            c => return Err(RespError::UnsuportedType(c as char)),
        };

        Ok(Some((frame, pos)))
    }

    /// Decodes the `$<len>\r\n<payload>` blob that follows `+FULLRESYNC`.
    /// Unlike a bulk string the payload carries no trailing CRLF.
    pub fn decode_snapshot(input: &[u8]) -> Decoded<Bytes> {
        let Some(&marker) = input.first() else {
            return Ok(None);
        };
        if marker != b'$' {
            return Err(RespError::UnsuportedType(marker as char));
        }
        let Some((line, pos)) = read_line(input, 1)? else {
            return Ok(None);
        };
        let len = checked_len(parse_integer(line)?)?;
        if input.len() < pos + len {
            return Ok(None);
        }
        Ok(Some((
            Bytes::copy_from_slice(&input[pos..pos + len]),
            pos + len,
        )))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Resp::SimpleString(s) => {
                buf.push(b'+');
                buf.extend(s.as_bytes());
                buf.extend(CTRLF);
            }
            Resp::SimpleError(e) => {
                buf.push(b'-');
                buf.extend(e.as_bytes());
                buf.extend(CTRLF);
            }
            Resp::Integer(i) => {
                let _ = write!(buf, ":{i}");
                buf.extend(CTRLF);
            }
            Resp::BulkString(b) => {
                let _ = write!(buf, "${}", b.len());
                buf.extend(CTRLF);
                buf.extend_from_slice(b);
                buf.extend(CTRLF);
            }
            Resp::Array(vec) => {
                let _ = write!(buf, "*{}", vec.len());
                buf.extend(CTRLF);
                for i in vec {
                    i.encode_into(buf);
                }
            }
            Resp::Null => buf.extend(b"$-1\r\n"),
        }
    }

    /// Frames a snapshot payload for the PSYNC reply.
    pub fn encode_snapshot(snapshot: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(snapshot.len() + 16);
        let _ = write!(buf, "${}", snapshot.len());
        buf.extend(CTRLF);
        buf.extend_from_slice(snapshot);
        buf
    }

    pub fn ok() -> Self {
        Self::SimpleString("OK".to_owned())
    }

    pub fn simple_string(input: impl Into<String>) -> Self {
        Self::SimpleString(input.into())
    }

    pub fn error(input: impl Into<String>) -> Self {
        Self::SimpleError(input.into())
    }

    pub fn bulk_string(input: impl Into<Bytes>) -> Self {
        Self::BulkString(input.into())
    }

    pub fn array(input: Vec<Resp>) -> Self {
        Self::Array(input)
    }

    /// Builds the array-of-bulk-strings shape every request uses.
    pub fn command<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Self::Array(parts.into_iter().map(|p| Resp::BulkString(p.into())).collect())
    }

    pub fn expect_bulk_string(&self) -> Option<&Bytes> {
        match self {
            Resp::BulkString(s) => Some(s),
            _ => None,
        }
    }

    pub fn expect_simple_string(&self) -> Option<&str> {
        match self {
            Resp::SimpleString(s) => Some(s),
            _ => None,
        }
    }
}

fn read_line(input: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, RespError> {
    let Some(rest) = input.get(start..) else {
        return Ok(None);
    };
    match rest.iter().take(MAX_LINE_LEN + 2).position(|b| *b == b'\n') {
        None if rest.len() > MAX_LINE_LEN + 1 => Err(RespError::LineTooLong),
        Some(0) => Err(RespError::NoCtrlf),
        Some(n) if rest[n - 1] != b'\r' => Err(RespError::NoCtrlf),
        Some(n) => Ok(Some((&rest[..n - 1], start + n + 1))),
        None => Ok(None),
    }
}

fn parse_integer(line: &[u8]) -> Result<i64, RespError> {
    from_utf8(line)
        .map_err(|_| RespError::NotAnInteger)?
        .parse::<i64>()
        .map_err(|_| RespError::NotAnInteger)
}

fn checked_len(len: i64) -> Result<usize, RespError> {
    match usize::try_from(len) {
        Ok(n) if n <= MAX_BULK_LEN => Ok(n),
        _ => Err(RespError::InvalidLength(len)),
    }
}

impl std::fmt::Debug for Resp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SimpleString(s) => write!(f, "+\"{s}\""),
            Self::SimpleError(e) => write!(f, "-\"{e}\""),
            Self::Integer(i) => write!(f, "{i}"),
            Self::BulkString(bs) => write!(f, "${} {}", bs.len(), String::from_utf8_lossy(bs)),
            Self::Array(array) => f.debug_list().entries(array).finish(),
            Self::Null => write!(f, "(nil)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Resp, usize) {
        Resp::decode(input).unwrap().unwrap()
    }

    #[test]
    fn decodes_command_array() {
        let input = b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n";
        let (frame, used) = decode_all(input);
        assert_eq!(used, input.len());
        assert_eq!(frame, Resp::command(["ECHO", "hey"]));
    }

    #[test]
    fn bulk_strings_are_binary_safe() {
        let payload = b"a\r\n*1\r\n$0\r\n\x00\xff";
        let frame = Resp::bulk_string(Bytes::from_static(payload));
        let encoded = frame.encode();
        assert_eq!(decode_all(&encoded), (frame, encoded.len()));
    }

    #[test]
    fn partial_input_needs_more_data() {
        let input = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        for cut in 0..input.len() {
            assert_eq!(Resp::decode(&input[..cut]), Ok(None), "cut at {cut}");
        }
    }

    #[test]
    fn leaves_remainder_for_next_frame() {
        let input = b"+PONG\r\n:42\r\n$-1\r\n";
        let (first, a) = decode_all(input);
        let (second, b) = decode_all(&input[a..]);
        let (third, c) = decode_all(&input[a + b..]);
        assert_eq!(first, Resp::simple_string("PONG"));
        assert_eq!(second, Resp::Integer(42));
        assert_eq!(third, Resp::Null);
        assert_eq!(a + b + c, input.len());
    }

    #[test]
    fn round_trips_nested_frames() {
        let frames = [
            Resp::Integer(-7),
            Resp::error("ERR nope"),
            Resp::bulk_string(""),
            Resp::Null,
            Resp::array(vec![
                Resp::simple_string("OK"),
                Resp::array(vec![Resp::Integer(1), Resp::Null]),
                Resp::bulk_string("x"),
            ]),
        ];
        for frame in frames {
            let encoded = frame.encode();
            assert_eq!(decode_all(&encoded), (frame, encoded.len()));
        }
    }

    #[test]
    fn null_array_decodes_as_null() {
        assert_eq!(decode_all(b"*-1\r\n"), (Resp::Null, 5));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            Resp::decode(b"?what\r\n"),
            Err(RespError::UnsuportedType('?'))
        );
        assert_eq!(Resp::decode(b"$-5\r\n"), Err(RespError::InvalidLength(-5)));
        assert_eq!(Resp::decode(b"*x\r\n"), Err(RespError::NotAnInteger));
        assert_eq!(Resp::decode(b"$3\r\nfooXY"), Err(RespError::NoCtrlf));
        assert_eq!(Resp::decode(b"+OK\n"), Err(RespError::NoCtrlf));
    }

    #[test]
    fn deep_nesting_is_rejected_without_recursing() {
        let input = b"*1\r\n".repeat(100_000);
        assert_eq!(Resp::decode(&input), Err(RespError::TooDeep));

        let mut nested = Resp::bulk_string("x");
        for _ in 0..MAX_DEPTH {
            nested = Resp::array(vec![nested]);
        }
        let encoded = nested.encode();
        assert_eq!(decode_all(&encoded), (nested, encoded.len()));
    }

    #[test]
    fn header_line_without_lf_is_capped() {
        let mut input = b"+".to_vec();
        input.extend(std::iter::repeat(b'a').take(MAX_LINE_LEN));
        assert_eq!(Resp::decode(&input), Ok(None));

        input.extend(b"aa");
        assert_eq!(Resp::decode(&input), Err(RespError::LineTooLong));
        assert_eq!(Resp::decode_snapshot(b"$1"), Ok(None));
    }

    #[test]
    fn snapshot_blob_has_no_trailing_ctrlf() {
        let encoded = Resp::encode_snapshot(b"REDIS\x00");
        assert_eq!(encoded, b"$6\r\nREDIS\x00");

        let mut stream = encoded.clone();
        stream.extend(Resp::command(["PING"]).encode());
        let (blob, used) = Resp::decode_snapshot(&stream).unwrap().unwrap();
        assert_eq!(&blob[..], b"REDIS\x00");
        assert_eq!(used, encoded.len());
        assert_eq!(Resp::decode_snapshot(&encoded[..7]), Ok(None));
    }
}

use crate::identifier::{Category, Identifier, IdentifierError};
use crate::payload::{payload_depth, payload_version, Payload, PayloadError, VERSION_FIELD};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const RECORD_MAGIC: &[u8; 4] = b"WREC";
const RECORD_FORMAT_VERSION: u8 = 1;
// magic + format + category + id_len
const FIXED_PREFIX_LEN: usize = 4 + 1 + 1 + 2;
// version + payload_len + payload_crc32
const FIXED_SUFFIX_LEN: usize = 4 + 4 + 4;
/// Nesting limit for payloads.  Stays below the decoders' own recursion
/// limits (serde_json 128 including the record wrapper, ciborium 256).
pub const MAX_PAYLOAD_DEPTH: usize = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordEncoding {
    #[default]
    Binary,
    Json,
}

impl FromStr for RecordEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(Self::Binary),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown record encoding '{other}'")),
        }
    }
}

/// One record as it sits on disk, before any fixing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodedRecord {
    pub category: Category,
    pub id: Identifier,
    pub version: u32,
    pub payload: Payload,
}

#[derive(Debug)]
pub enum DecodeError {
    Truncated { needed: usize, available: usize },
    BadMagic,
    UnsupportedFormat(u8),
    UnknownCategory(u8),
    InvalidIdentifier(IdentifierError),
    ChecksumMismatch { expected: u32, actual: u32 },
    TrailingBytes(usize),
    Payload(String),
    Json(serde_json::Error),
    NotAnObject,
    /// Payload `version` field disagrees with the header.
    VersionMismatch { header: u32, payload: String },
    TooDeep(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "record truncated: need {needed} bytes, have {available}")
            }
            Self::BadMagic => f.write_str("invalid record magic"),
            Self::UnsupportedFormat(format) => {
                write!(f, "unsupported record format version {format}")
            }
            Self::UnknownCategory(raw) => write!(f, "unknown record category {raw}"),
            Self::InvalidIdentifier(e) => write!(f, "invalid record id: {e}"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "payload checksum mismatch: expected {expected:08x} got {actual:08x}"
            ),
            Self::TrailingBytes(count) => write!(f, "{count} trailing bytes after record"),
            Self::Payload(e) => write!(f, "payload decode failed: {e}"),
            Self::Json(e) => write!(f, "json record decode failed: {e}"),
            Self::NotAnObject => f.write_str("record payload is not an object"),
            Self::VersionMismatch { header, payload } => write!(
                f,
                "payload version {payload} disagrees with record header version {header}"
            ),
            Self::TooDeep(depth) => write!(
                f,
                "payload nests {depth} levels deep, limit is {MAX_PAYLOAD_DEPTH}"
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<IdentifierError> for DecodeError {
    fn from(e: IdentifierError) -> Self {
        Self::InvalidIdentifier(e)
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

#[derive(Debug)]
pub enum EncodeError {
    IdTooLong(usize),
    NotAnObject,
    VersionMismatch { header: u32, payload: String },
    TooDeep(usize),
    Payload(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdTooLong(len) => write!(f, "record id is {len} bytes, limit is {}", u16::MAX),
            Self::NotAnObject => f.write_str("record payload is not an object"),
            Self::VersionMismatch { header, payload } => write!(
                f,
                "payload version {payload} disagrees with record version {header}"
            ),
            Self::TooDeep(depth) => write!(
                f,
                "payload nests {depth} levels deep, limit is {MAX_PAYLOAD_DEPTH}"
            ),
            Self::Payload(e) => write!(f, "payload encode failed: {e}"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Stateless record (de)serializer.  The encoding only selects the output
/// form; decoding accepts either form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordCodec {
    encoding: RecordEncoding,
}

impl RecordCodec {
    pub fn new(encoding: RecordEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> RecordEncoding {
        self.encoding
    }

    pub fn encode(
        &self,
        category: Category,
        id: &Identifier,
        version: u32,
        payload: &Payload,
    ) -> Result<Vec<u8>, EncodeError> {
        self.encode_with_hint(category, id, version, payload, 0)
    }

    /// `size_hint` is the caller's estimate of the encoded payload size.
    pub fn encode_with_hint(
        &self,
        category: Category,
        id: &Identifier,
        version: u32,
        payload: &Payload,
        size_hint: usize,
    ) -> Result<Vec<u8>, EncodeError> {
        check_payload_envelope(version, payload)?;
        match self.encoding {
            RecordEncoding::Binary => encode_binary(category, id, version, payload, size_hint),
            RecordEncoding::Json => encode_json(category, id, version, payload, size_hint),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedRecord, DecodeError> {
        decode_any(bytes)
    }
}

fn check_payload_envelope(version: u32, payload: &Payload) -> Result<(), EncodeError> {
    let depth = payload_depth(payload);
    if depth > MAX_PAYLOAD_DEPTH {
        return Err(EncodeError::TooDeep(depth));
    }
    match payload_version(payload) {
        Ok(_) if payload.get(VERSION_FIELD).is_none() => Ok(()),
        Ok(found) if found == version => Ok(()),
        Ok(found) => Err(EncodeError::VersionMismatch {
            header: version,
            payload: found.to_string(),
        }),
        Err(PayloadError::NotAnObject) => Err(EncodeError::NotAnObject),
        Err(PayloadError::InvalidVersion(raw)) => Err(EncodeError::VersionMismatch {
            header: version,
            payload: raw,
        }),
    }
}

fn check_decoded_envelope(record: &DecodedRecord) -> Result<(), DecodeError> {
    match check_payload_envelope(record.version, &record.payload) {
        Ok(()) => Ok(()),
        Err(EncodeError::NotAnObject) => Err(DecodeError::NotAnObject),
        Err(EncodeError::VersionMismatch { header, payload }) => {
            Err(DecodeError::VersionMismatch { header, payload })
        }
        Err(EncodeError::TooDeep(depth)) => Err(DecodeError::TooDeep(depth)),
        Err(other) => Err(DecodeError::Payload(other.to_string())),
    }
}

/// Decode either encoding, detected from the leading bytes.
pub fn decode_any(bytes: &[u8]) -> Result<DecodedRecord, DecodeError> {
    if bytes.starts_with(RECORD_MAGIC) {
        return decode_binary(bytes);
    }
    match bytes.iter().find(|byte| !byte.is_ascii_whitespace()) {
        Some(b'{') => decode_json(bytes),
        _ => Err(DecodeError::BadMagic),
    }
}

// ---------------------------------------------------------------------------
// Binary: magic, format, category, id, version, CBOR payload with crc32
// ---------------------------------------------------------------------------

pub fn encode_binary(
    category: Category,
    id: &Identifier,
    version: u32,
    payload: &Payload,
    size_hint: usize,
) -> Result<Vec<u8>, EncodeError> {
    let id_bytes = id.as_str().as_bytes();
    let id_len =
        u16::try_from(id_bytes.len()).map_err(|_| EncodeError::IdTooLong(id_bytes.len()))?;

    let mut body = Vec::with_capacity(size_hint);
    ciborium::into_writer(payload, &mut body).map_err(|e| EncodeError::Payload(e.to_string()))?;
    let body_len = u32::try_from(body.len())
        .map_err(|_| EncodeError::Payload("payload exceeds 4 GiB".into()))?;
    let mut hasher = Hasher::new();
    hasher.update(&body);
    let body_crc = hasher.finalize();

    let mut out =
        Vec::with_capacity(FIXED_PREFIX_LEN + id_bytes.len() + FIXED_SUFFIX_LEN + body.len());
    out.extend_from_slice(RECORD_MAGIC);
    out.push(RECORD_FORMAT_VERSION);
    out.push(category.to_u8());
    out.extend_from_slice(&id_len.to_le_bytes());
    out.extend_from_slice(id_bytes);
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(&body_crc.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.offset.saturating_add(len);
        if end > self.bytes.len() {
            return Err(DecodeError::Truncated {
                needed: end,
                available: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

pub fn decode_binary(bytes: &[u8]) -> Result<DecodedRecord, DecodeError> {
    let mut cursor = Cursor { bytes, offset: 0 };
    if cursor.take(RECORD_MAGIC.len())? != RECORD_MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let format = cursor.u8()?;
    if format != RECORD_FORMAT_VERSION {
        return Err(DecodeError::UnsupportedFormat(format));
    }
    let raw_category = cursor.u8()?;
    let category =
        Category::from_u8(raw_category).ok_or(DecodeError::UnknownCategory(raw_category))?;
    let id_len = cursor.u16()? as usize;
    let id_text = std::str::from_utf8(cursor.take(id_len)?)
        .map_err(|e| DecodeError::Payload(format!("record id is not utf-8: {e}")))?;
    let id = Identifier::parse(id_text)?;
    let version = cursor.u32()?;
    let body_len = cursor.u32()? as usize;
    let expected_crc = cursor.u32()?;
    let body = cursor.take(body_len)?;
    let trailing = bytes.len() - cursor.offset;
    if trailing != 0 {
        return Err(DecodeError::TrailingBytes(trailing));
    }

    let mut hasher = Hasher::new();
    hasher.update(body);
    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        return Err(DecodeError::ChecksumMismatch {
            expected: expected_crc,
            actual: actual_crc,
        });
    }
    let payload: Payload =
        ciborium::from_reader(body).map_err(|e| DecodeError::Payload(e.to_string()))?;

    let record = DecodedRecord {
        category,
        id,
        version,
        payload,
    };
    check_decoded_envelope(&record)?;
    Ok(record)
}

// ---------------------------------------------------------------------------
// JSON: {"category", "id", "version", "payload"}
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct JsonRecordRef<'a> {
    category: Category,
    id: &'a Identifier,
    version: u32,
    payload: &'a Payload,
}

pub fn encode_json(
    category: Category,
    id: &Identifier,
    version: u32,
    payload: &Payload,
    size_hint: usize,
) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(size_hint);
    serde_json::to_writer_pretty(
        &mut out,
        &JsonRecordRef {
            category,
            id,
            version,
            payload,
        },
    )
    .map_err(|e| EncodeError::Payload(e.to_string()))?;
    Ok(out)
}

pub fn decode_json(bytes: &[u8]) -> Result<DecodedRecord, DecodeError> {
    let record: DecodedRecord = serde_json::from_slice(bytes)?;
    check_decoded_envelope(&record)?;
    Ok(record)
}

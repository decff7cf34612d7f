//! 세그먼트 와이어 포맷
//!
//! ```text
//! 0               매직 "!!CDS!!" (7 bytes)
//! 7               header_size (u32 LE)
//! 11              헤더 블록 (header_size bytes)
//!                   uuid_size (u32 LE)
//!                   transfer_id (uuid_size bytes)
//!                   segment_count (u32 LE)
//!                   content_type (나머지 헤더 바이트)
//! 11+header_size  세그먼트 offset (u32 LE)
//! 15+header_size  페이로드 (메시지 끝까지)
//! ```
//!
//! 암호화, 배치, 브로커에 대해서는 알지 못한다.

use bytes::Bytes;

use crate::{Error, Result, MAGIC};

/// 세그먼트 (브로커 메시지 단위)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 전송 ID (파일 하나당 고유)
    pub transfer_id: String,

    /// 콘텐츠 타입 라벨
    pub content_type: String,

    /// 전송의 총 세그먼트 수
    pub segment_count: u32,

    /// 파일 내 세그먼트 위치 (0부터)
    pub offset: u32,

    /// 페이로드 (대개 암호문)
    pub payload: Bytes,
}

impl Segment {
    /// 세그먼트를 바이트로 직렬화
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    /// 바이트에서 세그먼트 역직렬화
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// 세그먼트를 바이트로 직렬화
pub fn encode(segment: &Segment) -> Vec<u8> {
    let id = segment.transfer_id.as_bytes();
    let content_type = segment.content_type.as_bytes();
    let header_size = 4 + id.len() + 4 + content_type.len();

    let mut buf = Vec::with_capacity(MAGIC.len() + 4 + header_size + 4 + segment.payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&(header_size as u32).to_le_bytes());
    buf.extend_from_slice(&(id.len() as u32).to_le_bytes());
    buf.extend_from_slice(id);
    buf.extend_from_slice(&segment.segment_count.to_le_bytes());
    buf.extend_from_slice(content_type);
    buf.extend_from_slice(&segment.offset.to_le_bytes());
    buf.extend_from_slice(&segment.payload);
    buf
}

/// 선두 7바이트가 매직 넘버인지 확인
///
/// 짧은 입력에도 패닉하지 않는다.
pub fn looks_like_segment(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC
}

/// 바이트에서 세그먼트 역직렬화
pub fn decode(bytes: &[u8]) -> Result<Segment> {
    if !looks_like_segment(bytes) {
        return Err(malformed("매직 넘버 불일치"));
    }

    let mut pos = MAGIC.len();
    let header_size = read_u32(bytes, &mut pos, "header_size")? as usize;
    let header = take(bytes, &mut pos, header_size, "헤더 블록")?;

    let mut hpos = 0;
    let uuid_size = read_u32(header, &mut hpos, "uuid_size")? as usize;
    let id = take(header, &mut hpos, uuid_size, "transfer_id")?;
    let segment_count = read_u32(header, &mut hpos, "segment_count")?;
    let content_type = &header[hpos..];

    let offset = read_u32(bytes, &mut pos, "offset")?;
    let payload = Bytes::copy_from_slice(&bytes[pos..]);

    let transfer_id = std::str::from_utf8(id)
        .map_err(|_| malformed("transfer_id가 UTF-8이 아님"))?
        .to_string();
    let content_type = std::str::from_utf8(content_type)
        .map_err(|_| malformed("content_type이 UTF-8이 아님"))?
        .to_string();

    Ok(Segment {
        transfer_id,
        content_type,
        segment_count,
        offset,
        payload,
    })
}

fn malformed(reason: &str) -> Error {
    Error::MalformedSegment {
        reason: reason.to_string(),
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize, field: &str) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| malformed(&format!("{} 길이가 버퍼를 초과", field)))?;
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

fn read_u32(buf: &[u8], pos: &mut usize, field: &str) -> Result<u32> {
    let raw = take(buf, pos, 4, field)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

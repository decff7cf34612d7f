//! 분할과 재조립
//!
//! - Splitter: 파일을 고정 크기 평문 조각으로 자르고 조각마다 독립적으로 암호화
//! - SegmentSet: 수신측에서 transfer_id 하나의 세그먼트를 offset 기준으로 모음

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rayon::prelude::*;

use crate::crypto::CipherStrategy;
use crate::wire::Segment;
use crate::{Error, Result};

/// 메시지 전송 시 사용하는 합성 파일 이름
pub const MESSAGE_FILE_NAME: &str = "message";

/// 콘텐츠 타입 라벨
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    /// 파일 (`file:<name>`)
    File(String),
    /// 자유 텍스트 메시지 (`message`)
    Message,
}

impl ContentType {
    /// 와이어 라벨
    pub fn label(&self) -> String {
        match self {
            ContentType::File(name) => format!("file:{}", name),
            ContentType::Message => MESSAGE_FILE_NAME.to_string(),
        }
    }

    /// 와이어 라벨 파싱 (모르는 라벨은 그 자체를 파일 이름으로 취급)
    pub fn parse(label: &str) -> Self {
        if let Some(name) = label.strip_prefix("file:") {
            ContentType::File(name.to_string())
        } else if label == MESSAGE_FILE_NAME {
            ContentType::Message
        } else {
            ContentType::File(label.to_string())
        }
    }

    /// 재조립 후 기록할 파일 이름
    pub fn file_name(&self) -> &str {
        match self {
            ContentType::File(name) => name,
            ContentType::Message => MESSAGE_FILE_NAME,
        }
    }
}

/// 새 전송 ID (128비트 hex)
pub fn new_transfer_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// 세그먼트 생성기 (송신측)
#[derive(Debug, Clone)]
pub struct Splitter {
    cipher: CipherStrategy,
    segment_size: usize,
}

impl Splitter {
    pub fn new(cipher: CipherStrategy, segment_size: usize) -> Self {
        Self {
            cipher,
            segment_size: segment_size.max(1),
        }
    }

    pub fn cipher(&self) -> &CipherStrategy {
        &self.cipher
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// 데이터를 세그먼트들로 분할
    ///
    /// 빈 입력은 세그먼트 0개. 조각 암호화는 병렬로 하되 offset 순서는 유지.
    pub fn split(
        &self,
        data: &[u8],
        transfer_id: &str,
        content_type: &ContentType,
    ) -> Result<Vec<Segment>> {
        let segment_count = ((data.len() + self.segment_size - 1) / self.segment_size) as u32;
        let label = content_type.label();

        data.par_chunks(self.segment_size)
            .enumerate()
            .map(|(idx, piece)| -> Result<Segment> {
                Ok(Segment {
                    transfer_id: transfer_id.to_string(),
                    content_type: label.clone(),
                    segment_count,
                    offset: idx as u32,
                    payload: Bytes::from(self.cipher.encrypt(piece)?),
                })
            })
            .collect()
    }

    /// 빈 파일용 세그먼트 (빈 평문을 암호화한 조각 하나)
    pub fn split_empty(&self, transfer_id: &str, content_type: &ContentType) -> Result<Segment> {
        Ok(Segment {
            transfer_id: transfer_id.to_string(),
            content_type: content_type.label(),
            segment_count: 1,
            offset: 0,
            payload: Bytes::from(self.cipher.encrypt(&[])?),
        })
    }
}

/// 수신 중인 전송의 세그먼트 모음
#[derive(Debug)]
pub struct SegmentSet {
    transfer_id: String,
    content_type: String,
    segment_count: u32,
    segments: BTreeMap<u32, Bytes>,
    created_at: Instant,
}

impl SegmentSet {
    /// 첫 세그먼트의 메타데이터로 생성 (세그먼트는 아직 삽입하지 않음)
    pub fn new(first: &Segment) -> Self {
        Self {
            transfer_id: first.transfer_id.clone(),
            content_type: first.content_type.clone(),
            segment_count: first.segment_count,
            segments: BTreeMap::new(),
            created_at: Instant::now(),
        }
    }

    /// 세그먼트 삽입
    ///
    /// 새 offset이면 true, 같은 offset이 이미 있으면 덮어쓰고 false.
    pub fn insert(&mut self, segment: Segment) -> Result<bool> {
        if segment.transfer_id != self.transfer_id
            || segment.segment_count != self.segment_count
            || segment.content_type != self.content_type
        {
            return Err(Error::MalformedSegment {
                reason: format!(
                    "transfer_id={} 메타데이터 불일치 (segment_count {} != {})",
                    segment.transfer_id, segment.segment_count, self.segment_count
                ),
            });
        }
        if segment.offset >= self.segment_count {
            return Err(Error::MalformedSegment {
                reason: format!(
                    "transfer_id={} offset {} >= segment_count {}",
                    segment.transfer_id, segment.offset, self.segment_count
                ),
            });
        }

        Ok(self.segments.insert(segment.offset, segment.payload).is_none())
    }

    /// 완료 여부: 서로 다른 offset 수 == 선언된 세그먼트 수
    pub fn is_complete(&self) -> bool {
        self.segments.len() == self.segment_count as usize
    }

    /// 누락된 offset 목록
    pub fn missing_offsets(&self) -> Vec<u32> {
        (0..self.segment_count)
            .filter(|offset| !self.segments.contains_key(offset))
            .collect()
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    pub fn received(&self) -> usize {
        self.segments.len()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// 완료된 세그먼트 모음을 복호화해 (파일 이름, 데이터)로 조립
pub fn reassemble(set: SegmentSet, cipher: &CipherStrategy) -> Result<(String, Vec<u8>)> {
    if !set.is_complete() {
        return Err(Error::IncompleteTransfer {
            transfer_id: set.transfer_id,
            received: set.segments.len(),
            expected: set.segment_count,
        });
    }

    let name = safe_file_name(ContentType::parse(&set.content_type).file_name())?;

    let transfer_id = set.transfer_id;
    let pieces: Vec<(u32, Bytes)> = set.segments.into_iter().collect();
    let decrypted = pieces
        .par_iter()
        .map(|(offset, payload)| {
            cipher.decrypt(payload).map_err(|source| Error::DecryptionFailed {
                transfer_id: transfer_id.clone(),
                offset: *offset,
                source,
            })
        })
        .collect::<Result<Vec<Vec<u8>>>>()?;

    Ok((name, decrypted.concat()))
}

/// 경로 요소가 없는 파일 이름만 허용
fn safe_file_name(name: &str) -> Result<String> {
    match Path::new(name).file_name().and_then(|n| n.to_str()) {
        Some(base) if base == name => Ok(name.to_string()),
        _ => Err(Error::MalformedSegment {
            reason: format!("허용되지 않는 파일 이름: {:?}", name),
        }),
    }
}

//! 에러 타입 정의

use thiserror::Error;

use crate::crypto::CryptoError;

/// 릴레이 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    #[error("잘못된 세그먼트: {reason}")]
    MalformedSegment { reason: String },

    #[error("불완전한 전송: transfer_id={transfer_id}, {received}/{expected} 세그먼트")]
    IncompleteTransfer {
        transfer_id: String,
        received: usize,
        expected: u32,
    },

    /// 대부분 송신측과 수신측의 키/패스프레이즈 불일치
    #[error("복호화 실패: transfer_id={transfer_id}, offset={offset}: {source} (송신측과 수신측 키가 같은지 확인하세요)")]
    DecryptionFailed {
        transfer_id: String,
        offset: u32,
        #[source]
        source: CryptoError,
    },

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    #[error("예상하지 않은 파일: job_id={job_id}, file={name}")]
    UnexpectedFile { job_id: i64, name: String },

    #[error("토픽 {topic}의 파티션이 {partitions}개: 단일 파티션만 지원")]
    MultiPartitionUnsupported { topic: String, partitions: usize },

    #[error("토픽 없음: {0}")]
    TopicNotFound(String),

    #[error("ACK 대기 타임아웃: job_id={job_id}, {waited_ms}ms 경과")]
    AckTimeout { job_id: i64, waited_ms: u64 },

    #[error("중단됨")]
    Interrupted,

    #[error("발행 실패: topic={topic}: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("잘못된 배치: {0}")]
    InvalidBatch(String),

    #[error("로그 크기 초과: {size} bytes (최대 {max_size} bytes)")]
    LogTooLarge { size: usize, max_size: usize },

    #[error("브로커 에러: {0}")]
    Broker(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

//! # jobrelay
//!
//! 메시지 브로커를 통한 잡 산출물 릴레이
//!
//! ## 핵심 특징
//! - **세그먼트 분할**: 큰 파일을 브로커 메시지 크기의 세그먼트로 분할
//! - **자기 서술형 프레임**: 다른 문맥 없이도 세그먼트 식별, 정렬, 재조립 가능
//! - **세그먼트별 암호화**: 대칭키(ChaCha20-Poly1305) 또는 X25519 봉투 암호화
//! - **배치 컨텍스트**: 잡 단위로 기대 파일 목록을 선언하고 수신 완료 시 훅 실행
//! - **ACK 교환**: 같은 브로커로 결과(OK/KO)와 로그, 산출물을 송신측에 회신
//!
//! 브로커는 파티션 단위로 순서가 보장되는 at-least-once 스트림으로만 취급한다.
//! 하나의 전송은 반드시 하나의 파티션을 사용한다.

pub mod ack;
pub mod broker;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod hook;
pub mod message;
pub mod receiver;
pub mod sender;
pub mod spool;
pub mod stats;
pub mod wire;

pub use ack::{AckWaiter, ResultPublisher};
pub use broker::{Broker, MemoryBroker, Record};
pub use chunk::{ContentType, SegmentSet, Splitter};
pub use config::Config;
pub use crypto::{AsymmetricKey, CipherStrategy, CryptoError, SymmetricKey};
pub use error::{Error, Result};
pub use hook::{CloseHook, CommandHook};
pub use message::{Ack, AckResult, Message, TransferContext};
pub use receiver::{Dispatcher, Outcome, Receiver, ReceiverState};
pub use sender::Sender;
pub use spool::SpoolBroker;
pub use stats::RelayStats;
pub use wire::Segment;

/// 매직 넘버 (세그먼트 식별용)
pub const MAGIC: &[u8; 7] = b"!!CDS!!";

/// 기본 세그먼트 페이로드 크기 (바이트)
pub const DEFAULT_SEGMENT_SIZE: usize = 512 * 1024; // 512KB

/// ACK 로그 첨부 최대 크기 (바이트)
pub const MAX_ACK_LOG_SIZE: usize = 700 * 1024;

/// ACK 대기 중 진행 로그 주기 (밀리초)
pub const PROGRESS_INTERVAL_MS: u64 = 5000;

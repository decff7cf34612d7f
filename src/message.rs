//! 브로커 메시지 정의
//!
//! 컨텍스트와 ACK는 매직 넘버 없는 평범한 JSON이다.
//! 분류 우선순위: 컨텍스트 → ACK → 세그먼트 → 불투명 메시지

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::wire::{self, Segment};
use crate::{Error, Result};

/// 전송 컨텍스트 (잡 하나의 파일 배치)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferContext {
    pub job_id: i64,

    /// 기대 파일 목록 (생성 시 고정)
    pub files: Vec<String>,

    /// 수신측 출력 디렉터리
    pub directory: String,

    /// 파일별 수신 여부
    #[serde(default)]
    pub received_files: HashMap<String, bool>,

    /// 모든 파일 수신 완료 (한 번 true가 되면 되돌아가지 않음)
    #[serde(default)]
    pub closed: bool,
}

impl TransferContext {
    pub fn new(job_id: i64, files: Vec<String>, directory: impl Into<String>) -> Self {
        Self {
            job_id,
            files,
            directory: directory.into(),
            received_files: HashMap::new(),
            closed: false,
        }
    }

    /// 수신측 초기화: 선언된 모든 파일을 false로, 종료 플래그 해제
    pub fn reset_for_receive(&mut self) {
        self.received_files = self.files.iter().map(|f| (f.clone(), false)).collect();
        self.closed = false;
    }

    /// 선언된 파일인지 확인
    pub fn expects(&self, name: &str) -> bool {
        self.received_files.contains_key(name)
    }

    pub fn is_received(&self, name: &str) -> bool {
        self.received_files.get(name).copied().unwrap_or(false)
    }

    /// 파일 수신 표시 후 종료 여부 평가
    ///
    /// 이번 호출로 처음 닫혔을 때만 true를 반환한다.
    pub fn mark_received(&mut self, name: &str) -> bool {
        if let Some(received) = self.received_files.get_mut(name) {
            *received = true;
        }

        if !self.closed && self.received_files.values().all(|&received| received) {
            self.closed = true;
            return true;
        }
        false
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckResult {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "KO")]
    Ko,
}

impl AckResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, AckResult::Ok)
    }
}

/// 결과 회신 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub context: TransferContext,
    pub result: AckResult,

    /// 로그 첨부 (JSON에서는 base64)
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub log: Option<Vec<u8>>,
}

impl Ack {
    pub fn new(context: TransferContext, result: AckResult, log: Option<Vec<u8>>) -> Self {
        Self {
            context,
            result,
            log,
        }
    }

    pub fn job_id(&self) -> i64 {
        self.context.job_id
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// 수신 메시지 분류
#[derive(Debug)]
pub enum Message {
    Context(TransferContext),
    Ack(Ack),
    Segment(Segment),
    /// 매직 넘버는 맞지만 디코딩 실패
    Malformed(Error),
    /// 진단용 등 알 수 없는 메시지
    Opaque,
}

impl Message {
    /// 고정 우선순위로 원시 메시지 분류
    pub fn classify(bytes: &[u8]) -> Self {
        if let Ok(context) = serde_json::from_slice::<TransferContext>(bytes) {
            return Message::Context(context);
        }
        if let Ok(ack) = serde_json::from_slice::<Ack>(bytes) {
            return Message::Ack(ack);
        }
        if wire::looks_like_segment(bytes) {
            return match wire::decode(bytes) {
                Ok(segment) => Message::Segment(segment),
                Err(e) => Message::Malformed(e),
            };
        }
        Message::Opaque
    }

    /// 로그용 이름
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Context(_) => "context",
            Message::Ack(_) => "ack",
            Message::Segment(_) => "segment",
            Message::Malformed(_) => "malformed",
            Message::Opaque => "opaque",
        }
    }
}

/// `Option<Vec<u8>>` ↔ base64 문자열
mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        data.as_ref().map(|d| STANDARD.encode(d)).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn context() -> TransferContext {
        TransferContext::new(42, vec!["a.txt".into(), "b.txt".into()], "out")
    }

    #[test]
    fn test_context_json_shape() {
        let json = String::from_utf8(context().to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"job_id\":42"));
        assert!(json.contains("\"files\":[\"a.txt\",\"b.txt\"]"));
        assert!(json.contains("\"directory\":\"out\""));
        assert!(!json.starts_with("!!CDS!!"));
    }

    #[test]
    fn test_context_closes_exactly_once() {
        let mut ctx = context();
        ctx.reset_for_receive();
        assert!(ctx.expects("a.txt"));
        assert!(!ctx.expects("c.txt"));

        assert!(!ctx.mark_received("a.txt"));
        assert!(!ctx.closed);
        assert!(ctx.mark_received("b.txt"));
        assert!(ctx.closed);

        // 중복 수신은 다시 닫지 않음
        assert!(!ctx.mark_received("b.txt"));
        assert!(ctx.closed);
    }

    #[test]
    fn test_classify_context() {
        let bytes = context().to_bytes().unwrap();
        match Message::classify(&bytes) {
            Message::Context(ctx) => assert_eq!(ctx, context()),
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn test_classify_ack() {
        let ack = Ack::new(context(), AckResult::Ko, Some(b"build failed".to_vec()));
        let bytes = ack.to_bytes().unwrap();

        let json = String::from_utf8(bytes.clone()).unwrap();
        assert!(json.contains("\"result\":\"KO\""));
        // "build failed" = "YnVpbGQgZmFpbGVk"
        assert!(json.contains("YnVpbGQgZmFpbGVk"));

        match Message::classify(&bytes) {
            Message::Ack(parsed) => {
                assert_eq!(parsed.job_id(), 42);
                assert_eq!(parsed.log.as_deref(), Some(b"build failed".as_slice()));
            }
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn test_classify_ack_without_log() {
        let bytes = Ack::new(context(), AckResult::Ok, None).to_bytes().unwrap();
        assert!(!String::from_utf8(bytes.clone()).unwrap().contains("log"));
        assert!(matches!(Message::classify(&bytes), Message::Ack(a) if a.log.is_none() && a.result.is_ok()));
    }

    #[test]
    fn test_classify_segment_and_malformed() {
        let segment = Segment {
            transfer_id: "abc".into(),
            content_type: "message".into(),
            segment_count: 1,
            offset: 0,
            payload: Bytes::from_static(b"x"),
        };
        assert!(matches!(Message::classify(&segment.encode()), Message::Segment(_)));
        assert!(matches!(Message::classify(b"!!CDS!!\x01"), Message::Malformed(_)));
    }

    #[test]
    fn test_classify_opaque() {
        assert!(matches!(Message::classify(b"hello"), Message::Opaque));
        assert!(matches!(Message::classify(b""), Message::Opaque));
        // 일부 필드만 있는 JSON은 컨텍스트가 아님
        assert!(matches!(Message::classify(br#"{"job_id": 1}"#), Message::Opaque));
    }
}

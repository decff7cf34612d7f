//! 릴레이 설정

use std::path::PathBuf;
use std::time::Duration;

use crate::{DEFAULT_SEGMENT_SIZE, MAX_ACK_LOG_SIZE, PROGRESS_INTERVAL_MS};

/// 릴레이 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 세그먼트 페이로드 크기 (바이트, 암호화 전 평문 기준)
    pub segment_size: usize,

    /// 데이터 토픽 (송신측 → 수신측)
    pub topic: String,

    /// ACK 토픽 (수신측 → 송신측)
    pub ack_topic: String,

    /// 컨슈머 그룹
    pub group: String,

    /// 수신 파일을 쓰는 작업 디렉터리
    pub work_dir: PathBuf,

    /// 컨텍스트 종료 시 실행할 훅 (선택)
    pub hook: Option<PathBuf>,

    /// ACK 대기 타임아웃 (밀리초)
    pub ack_timeout_ms: u64,

    /// ACK 대기 중 진행 로그 주기 (밀리초)
    pub progress_interval_ms: u64,

    /// 미완료 전송 최대 보관 시간 (밀리초)
    /// 0이면 무제한
    pub transfer_max_age_ms: u64,

    /// ACK 로그 첨부 최대 크기
    pub max_ack_log_size: usize,

    /// 최근 완료된 transfer_id 기억 개수 (중복 세그먼트 제거용)
    pub completed_history: usize,

    /// 스풀 브로커 폴링 간격 (밀리초)
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            topic: "jobrelay".to_string(),
            ack_topic: "jobrelay-ack".to_string(),
            group: "jobrelay".to_string(),
            work_dir: PathBuf::from("."),
            hook: None,
            ack_timeout_ms: 10 * 60 * 1000,   // 10분
            progress_interval_ms: PROGRESS_INTERVAL_MS,
            transfer_max_age_ms: 0,           // 무제한
            max_ack_log_size: MAX_ACK_LOG_SIZE,
            completed_history: 1024,
            poll_interval_ms: 200,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// 미완료 전송 최대 보관 시간 (None이면 무제한)
    pub fn transfer_max_age(&self) -> Option<Duration> {
        if self.transfer_max_age_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.transfer_max_age_ms))
        }
    }

    /// 손실이 잦은 브로커용 설정
    ///
    /// 완료되지 않는 전송을 10분 뒤 정리해 메모리 사용량을 제한한다.
    pub fn lossy_broker() -> Self {
        Self {
            transfer_max_age_ms: 10 * 60 * 1000,
            completed_history: 4096,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.segment_size, 512 * 1024);
        assert_eq!(config.progress_interval(), Duration::from_secs(5));
        assert!(config.transfer_max_age().is_none());
    }

    #[test]
    fn test_lossy_broker_preset() {
        let config = Config::lossy_broker();
        assert_eq!(config.transfer_max_age(), Some(Duration::from_secs(600)));
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
    }
}

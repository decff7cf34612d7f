//! 수신 루프 통계

use std::time::{Duration, Instant};

use tracing::info;

/// 수신 루프 통계
#[derive(Debug, Clone)]
pub struct RelayStats {
    /// 처리한 원시 메시지 수
    pub total_messages: u64,

    /// 컨텍스트 메시지 수
    pub contexts: u64,

    /// 교체된 컨텍스트 수 (같은 job_id 재수신)
    pub replaced_contexts: u64,

    /// 종료된 컨텍스트 수
    pub closed_contexts: u64,

    /// ACK 메시지 수
    pub acks: u64,

    /// 정상 세그먼트 수
    pub segments: u64,

    /// 중복 세그먼트 수 (같은 offset 또는 이미 완료된 전송)
    pub duplicate_segments: u64,

    /// 잘못된 세그먼트 수
    pub malformed_segments: u64,

    /// 불투명 메시지 수
    pub opaque_messages: u64,

    /// 기록한 파일 수
    pub files_written: u64,

    /// 거부한 파일 수
    pub files_rejected: u64,

    /// 복호화 실패 수
    pub decrypt_failures: u64,

    /// 시간 초과로 버린 전송 수
    pub evicted_transfers: u64,

    /// 기록한 바이트
    pub bytes_written: u64,

    /// 시작 시간
    pub started_at: Instant,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            total_messages: 0,
            contexts: 0,
            replaced_contexts: 0,
            closed_contexts: 0,
            acks: 0,
            segments: 0,
            duplicate_segments: 0,
            malformed_segments: 0,
            opaque_messages: 0,
            files_written: 0,
            files_rejected: 0,
            decrypt_failures: 0,
            evicted_transfers: 0,
            bytes_written: 0,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 기록 처리량 (MB/s)
    pub fn throughput_mbps(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_written as f64 / secs / 1_000_000.0
    }

    /// 통계 요약 로그
    pub fn log_summary(&self, label: &str) {
        info!(
            "{} 통계: messages={}, segments={} (dup={}, malformed={}), files={} (rejected={}), \
             decrypt_failures={}, contexts={} (replaced={}, closed={}), acks={}, opaque={}, evicted={}, \
             {:.2} MB in {:.1}s ({:.2} MB/s)",
            label,
            self.total_messages,
            self.segments,
            self.duplicate_segments,
            self.malformed_segments,
            self.files_written,
            self.files_rejected,
            self.decrypt_failures,
            self.contexts,
            self.replaced_contexts,
            self.closed_contexts,
            self.acks,
            self.opaque_messages,
            self.evicted_transfers,
            self.bytes_written as f64 / 1_000_000.0,
            self.elapsed().as_secs_f64(),
            self.throughput_mbps(),
        );
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

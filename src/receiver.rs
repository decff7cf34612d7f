//! 수신자
//!
//! - Dispatcher: 메시지 분류, 세그먼트 누적, 재조립, 파일 기록, 컨텍스트 종료 처리
//! - Receiver: 단일 파티션을 읽어 Dispatcher에 넘기고 메시지마다 오프셋 커밋
//!
//! 모든 상태는 루프 하나가 소유한다. 같은 파티션에 두 루프를 돌리지 않는 것은
//! 단일 파티션 제약으로 보장한다.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{single_partition, Broker};
use crate::chunk::{reassemble, ContentType, SegmentSet};
use crate::crypto::CipherStrategy;
use crate::hook::{CloseHook, CommandHook};
use crate::message::{Ack, Message, TransferContext};
use crate::stats::RelayStats;
use crate::wire::Segment;
use crate::{Config, Error, Result};

/// 불투명 메시지 로그 최대 길이
const OPAQUE_LOG_LIMIT: usize = 512;

/// 메시지 하나의 처리 결과
#[derive(Debug)]
pub enum Outcome {
    /// 컨텍스트 수신 (같은 job_id가 있었으면 replaced)
    ContextOpened { job_id: i64, replaced: bool },
    /// 세그먼트 누적 (전송 미완료)
    SegmentAccepted {
        transfer_id: String,
        received: usize,
        expected: u32,
    },
    /// 중복 세그먼트
    Duplicate { transfer_id: String },
    /// 파일 기록 완료
    FileWritten {
        job_id: Option<i64>,
        name: String,
        path: PathBuf,
        /// 이 파일로 컨텍스트가 닫혔는지
        closed: bool,
    },
    /// 세그먼트 또는 파일 거부
    Rejected(Error),
    /// ACK (처리는 호출자 몫)
    Ack(Ack),
    /// 무시한 메시지
    Ignored(&'static str),
    /// 불투명 메시지
    Opaque,
}

/// 메시지 분류 및 재조립기
pub struct Dispatcher {
    cipher: CipherStrategy,
    work_dir: PathBuf,
    max_age: Option<Duration>,

    /// transfer_id -> 수신 중인 세그먼트
    transfers: HashMap<String, SegmentSet>,

    /// job_id -> 열린 컨텍스트
    contexts: HashMap<i64, TransferContext>,

    /// 가장 최근에 받은 컨텍스트 (재조립된 파일이 속할 배치)
    active_job: Option<i64>,

    /// 최근 완료된 transfer_id (늦게 도착한 중복 세그먼트 제거용)
    completed: VecDeque<String>,
    completed_ids: HashSet<String>,
    completed_history: usize,

    hook: Option<Box<dyn CloseHook>>,
    stats: RelayStats,
}

impl Dispatcher {
    pub fn new(cipher: CipherStrategy, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            cipher,
            work_dir: work_dir.into(),
            max_age: None,
            transfers: HashMap::new(),
            contexts: HashMap::new(),
            active_job: None,
            completed: VecDeque::new(),
            completed_ids: HashSet::new(),
            completed_history: 1024,
            hook: None,
            stats: RelayStats::new(),
        }
    }

    /// 설정으로 생성 (훅이 있으면 외부 명령 훅 사용)
    pub fn from_config(config: &Config, cipher: CipherStrategy) -> Self {
        let mut dispatcher = Self::new(cipher, config.work_dir.clone());
        dispatcher.max_age = config.transfer_max_age();
        dispatcher.completed_history = config.completed_history;
        if let Some(command) = &config.hook {
            let hook = CommandHook::new(command);
            info!(hook = %hook.command().display(), "종료 훅 등록");
            dispatcher.hook = Some(Box::new(hook));
        }
        dispatcher
    }

    pub fn with_hook(mut self, hook: Box<dyn CloseHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn context(&self, job_id: i64) -> Option<&TransferContext> {
        self.contexts.get(&job_id)
    }

    /// 컨텍스트 추적 중단
    pub fn forget(&mut self, job_id: i64) -> Option<TransferContext> {
        if self.active_job == Some(job_id) {
            self.active_job = None;
        }
        self.contexts.remove(&job_id)
    }

    /// 수신 중인 전송 수
    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    /// 정지 전 정리: 미완료 전송을 버리고 열린 컨텍스트를 기록
    ///
    /// 상태는 메모리에만 있으므로 재시작 후 이어받지 않는다. 버린 전송 수를 반환.
    pub fn drain(&mut self) -> usize {
        for (transfer_id, set) in &self.transfers {
            warn!(
                transfer_id = %transfer_id,
                "정지로 미완료 전송 폐기: {}/{} 세그먼트",
                set.received(),
                set.segment_count()
            );
        }
        for (job_id, context) in &self.contexts {
            let pending: Vec<&String> = context
                .files
                .iter()
                .filter(|name| !context.is_received(name))
                .collect();
            warn!(job_id, ?pending, "정지 시점에 열린 컨텍스트");
        }
        let dropped = self.transfers.len();
        self.transfers.clear();
        dropped
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// 원시 메시지 하나 처리
    pub async fn handle(&mut self, bytes: &[u8]) -> Outcome {
        self.stats.total_messages += 1;
        self.evict_stale();

        match Message::classify(bytes) {
            Message::Context(context) => self.on_context(context).await,
            Message::Ack(ack) => {
                self.stats.acks += 1;
                Outcome::Ack(ack)
            }
            Message::Segment(segment) => self.on_segment(segment).await,
            Message::Malformed(e) => {
                self.stats.malformed_segments += 1;
                error!("세그먼트 디코딩 실패: {}", e);
                Outcome::Rejected(e)
            }
            Message::Opaque => {
                self.stats.opaque_messages += 1;
                let text = String::from_utf8_lossy(&bytes[..bytes.len().min(OPAQUE_LOG_LIMIT)]);
                info!(len = bytes.len(), "불투명 메시지: {}", text);
                Outcome::Opaque
            }
        }
    }

    /// 오래된 미완료 전송 정리
    pub fn evict_stale(&mut self) -> usize {
        let Some(max_age) = self.max_age else {
            return 0;
        };

        let before = self.transfers.len();
        self.transfers.retain(|transfer_id, set| {
            if set.age() > max_age {
                warn!(
                    "전송 {} 타임아웃: {}/{} 세그먼트 수신, missing={:?}",
                    transfer_id,
                    set.received(),
                    set.segment_count(),
                    set.missing_offsets()
                );
                false
            } else {
                true
            }
        });
        let evicted = before - self.transfers.len();
        self.stats.evicted_transfers += evicted as u64;
        evicted
    }

    async fn on_context(&mut self, mut context: TransferContext) -> Outcome {
        self.stats.contexts += 1;
        let job_id = context.job_id;

        if context.files.is_empty() {
            warn!(job_id, "파일 목록이 빈 컨텍스트 무시");
            return Outcome::Ignored("empty context");
        }

        if let Some(reason) = unsafe_context_path(&context) {
            warn!(job_id, directory = %context.directory, "컨텍스트 무시: {}", reason);
            return Outcome::Ignored("unsafe context path");
        }

        context.reset_for_receive();

        let replaced = match self.contexts.remove(&job_id) {
            Some(previous) => {
                self.stats.replaced_contexts += 1;
                warn!(
                    job_id,
                    directory = %previous.directory,
                    "같은 job_id의 컨텍스트 재수신: 이전 배치를 버리고 다시 시작"
                );
                self.discard_written_files(&previous).await;
                true
            }
            None => false,
        };

        info!(
            job_id,
            files = ?context.files,
            directory = %context.directory,
            "컨텍스트 수신"
        );

        self.contexts.insert(job_id, context);
        self.active_job = Some(job_id);
        Outcome::ContextOpened { job_id, replaced }
    }

    /// 이전 배치에서 이미 기록한 파일 삭제 (선언된 파일만, 디렉터리는 남김)
    async fn discard_written_files(&self, previous: &TransferContext) {
        let dir = self.work_dir.join(&previous.directory);
        for (name, received) in &previous.received_files {
            if !received {
                continue;
            }
            let path = dir.join(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "이전 배치 파일 삭제"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "이전 배치 파일 삭제 실패: {}", e),
            }
        }
    }

    async fn on_segment(&mut self, segment: Segment) -> Outcome {
        let transfer_id = segment.transfer_id.clone();

        if self.completed_ids.contains(&transfer_id) {
            self.stats.duplicate_segments += 1;
            debug!(transfer_id = %transfer_id, offset = segment.offset, "완료된 전송의 중복 세그먼트");
            return Outcome::Duplicate { transfer_id };
        }

        let set = self
            .transfers
            .entry(transfer_id.clone())
            .or_insert_with(|| SegmentSet::new(&segment));

        let offset = segment.offset;
        let is_new = match set.insert(segment) {
            Ok(is_new) => is_new,
            Err(e) => {
                if set.received() == 0 {
                    self.transfers.remove(&transfer_id);
                }
                self.stats.malformed_segments += 1;
                warn!("세그먼트 거부: {}", e);
                return Outcome::Rejected(e);
            }
        };

        if is_new {
            self.stats.segments += 1;
        } else {
            self.stats.duplicate_segments += 1;
            debug!(transfer_id = %transfer_id, offset, "중복 offset 덮어씀");
        }

        if !set.is_complete() {
            debug!(
                transfer_id = %transfer_id,
                offset,
                "세그먼트 {}/{}",
                set.received(),
                set.segment_count()
            );
            return if is_new {
                Outcome::SegmentAccepted {
                    transfer_id,
                    received: set.received(),
                    expected: set.segment_count(),
                }
            } else {
                Outcome::Duplicate { transfer_id }
            };
        }

        // 완료: 결과와 상관없이 메모리에서 제거
        let Some(set) = self.transfers.remove(&transfer_id) else {
            return Outcome::Ignored("missing segment set");
        };
        self.remember_completed(transfer_id.clone());
        let file_name = ContentType::parse(set.content_type()).file_name().to_string();

        match reassemble(set, &self.cipher) {
            Ok((name, data)) => self.deliver(&transfer_id, name, data).await,
            Err(e @ Error::DecryptionFailed { .. }) => {
                self.stats.decrypt_failures += 1;
                error!(
                    cipher = self.cipher.name(),
                    "{} - 송신측과 같은 키/패스프레이즈를 쓰는지 확인하세요. 전송을 버립니다.",
                    e
                );
                if let Some(job_id) = self.owner_of(&file_name) {
                    self.forget(job_id);
                    warn!(job_id, file = %file_name, "복호화 실패로 배치 포기");
                }
                Outcome::Rejected(e)
            }
            Err(e) => {
                self.stats.malformed_segments += 1;
                error!("재조립 실패: {}", e);
                Outcome::Rejected(e)
            }
        }
    }

    fn remember_completed(&mut self, transfer_id: String) {
        if self.completed_history == 0 {
            return;
        }
        if self.completed.len() >= self.completed_history {
            if let Some(oldest) = self.completed.pop_front() {
                self.completed_ids.remove(&oldest);
            }
        }
        self.completed_ids.insert(transfer_id.clone());
        self.completed.push_back(transfer_id);
    }

    /// 파일 이름을 선언한 열린 컨텍스트 찾기
    ///
    /// 아직 받지 않은 파일로 선언한 컨텍스트를 먼저, 그중에서도 가장 최근 컨텍스트를 우선한다.
    fn owner_of(&self, name: &str) -> Option<i64> {
        let declares = |job_id: &i64, pending: bool| {
            self.contexts
                .get(job_id)
                .is_some_and(|context| context.expects(name) && (!pending || !context.is_received(name)))
        };

        for pending in [true, false] {
            if let Some(job_id) = self.active_job.filter(|id| declares(id, pending)) {
                return Some(job_id);
            }
            let latest = self.contexts.keys().copied().filter(|id| declares(id, pending)).max();
            if latest.is_some() {
                return latest;
            }
        }
        None
    }

    /// 재조립된 파일 기록
    async fn deliver(&mut self, transfer_id: &str, name: String, data: Vec<u8>) -> Outcome {
        if self.contexts.is_empty() {
            // 컨텍스트 없음: 작업 디렉터리에 그대로 기록
            let path = self.work_dir.join(&name);
            if let Err(e) = write_file(&path, &data).await {
                error!(path = %path.display(), "파일 기록 실패: {}", e);
                return Outcome::Rejected(e);
            }
            self.record_written(transfer_id, &path, data.len());
            return Outcome::FileWritten {
                job_id: None,
                name,
                path,
                closed: false,
            };
        }

        let Some(job_id) = self.owner_of(&name) else {
            self.stats.files_rejected += 1;
            let job_id = self
                .active_job
                .or_else(|| self.contexts.keys().copied().max())
                .unwrap_or_default();
            let e = Error::UnexpectedFile { job_id, name };
            error!(transfer_id, open_contexts = self.contexts.len(), "{} - 기록하지 않음", e);
            return Outcome::Rejected(e);
        };

        let directory = match self.contexts.get(&job_id) {
            Some(context) => context.directory.clone(),
            None => return Outcome::Ignored("missing context"),
        };

        let path = self.work_dir.join(&directory).join(&name);
        if let Err(e) = write_file(&path, &data).await {
            error!(path = %path.display(), "파일 기록 실패: {}", e);
            return Outcome::Rejected(e);
        }
        self.record_written(transfer_id, &path, data.len());

        let closed = self
            .contexts
            .get_mut(&job_id)
            .map(|context| context.mark_received(&name))
            .unwrap_or(false);

        if closed {
            if let Some(context) = self.forget(job_id) {
                self.close(context).await;
            }
        }

        Outcome::FileWritten {
            job_id: Some(job_id),
            name,
            path,
            closed,
        }
    }

    fn record_written(&mut self, transfer_id: &str, path: &Path, len: usize) {
        self.stats.files_written += 1;
        self.stats.bytes_written += len as u64;
        info!(transfer_id, path = %path.display(), bytes = len, "파일 기록");
    }

    /// 컨텍스트 종료: 마커 파일 기록 후 훅 실행
    async fn close(&mut self, context: TransferContext) {
        self.stats.closed_contexts += 1;
        let job_id = context.job_id;
        info!(job_id, files = context.files.len(), "컨텍스트 종료: 모든 파일 수신");

        let marker = self.work_dir.join(format!("{}.json", job_id));
        let snapshot = match serde_json::to_vec_pretty(&context) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(job_id, "컨텍스트 직렬화 실패: {}", e);
                return;
            }
        };
        if let Err(e) = write_file(&marker, &snapshot).await {
            error!(job_id, marker = %marker.display(), "마커 파일 기록 실패: {}", e);
            return;
        }

        if let Some(hook) = &self.hook {
            hook.on_close(&marker).await;
        }
    }
}

/// 작업 디렉터리 밖을 가리키는 경로 검사
///
/// 디렉터리는 상대 경로이며 `..`이 없어야 하고, 파일 이름은 경로 요소가 없어야 한다.
fn unsafe_context_path(context: &TransferContext) -> Option<String> {
    let directory_ok = Path::new(&context.directory)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !directory_ok {
        return Some(format!("허용되지 않는 디렉터리: {:?}", context.directory));
    }

    context
        .files
        .iter()
        .find(|name| Path::new(name.as_str()).file_name().and_then(|n| n.to_str()) != Some(name.as_str()))
        .map(|name| format!("허용되지 않는 파일 이름: {:?}", name))
}

async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    Ok(())
}

/// 수신 루프 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Running,
    /// 정지 신호 수신, 현재 메시지 마무리 중
    Draining,
    Stopped,
}

/// 수신자 (파티션 하나당 하나)
pub struct Receiver<'a> {
    broker: &'a dyn Broker,
    topic: String,
    group: String,
    dispatcher: Dispatcher,
    state: ReceiverState,
}

impl<'a> Receiver<'a> {
    pub fn new(
        broker: &'a dyn Broker,
        topic: impl Into<String>,
        group: impl Into<String>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            group: group.into(),
            dispatcher,
            state: ReceiverState::Stopped,
        }
    }

    /// 설정의 데이터 토픽과 그룹으로 생성
    pub fn from_config(broker: &'a dyn Broker, config: &Config, cipher: CipherStrategy) -> Self {
        Self::new(
            broker,
            config.topic.clone(),
            config.group.clone(),
            Dispatcher::from_config(config, cipher),
        )
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// 정지 신호까지 수신
    ///
    /// 파티션이 둘 이상이면 시작하지 않는다. 메시지 하나 처리 후마다 다음 오프셋을 커밋한다.
    /// 개별 메시지 오류로는 멈추지 않고 브로커 오류에서만 에러를 반환한다.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let broker = self.broker;
        let partition = single_partition(broker, &self.topic).await?;
        let mut offset = broker
            .committed(&self.group, &self.topic, partition)
            .await?
            .unwrap_or(0);

        info!(
            topic = %self.topic,
            group = %self.group,
            partition,
            offset,
            "수신 시작"
        );
        self.state = ReceiverState::Running;

        let result = loop {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                record = broker.fetch(&self.topic, partition, offset) => Some(record),
            };

            let record = match fetched {
                Some(Ok(record)) => record,
                Some(Err(e)) => break Err(e),
                None => {
                    self.state = ReceiverState::Draining;
                    info!(topic = %self.topic, "정지 신호 수신: 정리 중");
                    let dropped = self.dispatcher.drain();
                    info!(topic = %self.topic, dropped, "정리 완료");
                    break Ok(());
                }
            };

            match self.dispatcher.handle(&record.payload).await {
                Outcome::Ack(ack) => {
                    info!(job_id = ack.job_id(), result = ?ack.result, "ACK 수신 (무시)");
                }
                outcome => debug!(offset = record.offset, ?outcome, "메시지 처리"),
            }

            offset = record.offset + 1;
            if let Err(e) = broker.commit(&self.group, &self.topic, partition, offset).await {
                break Err(e);
            }
        };

        self.state = ReceiverState::Stopped;
        self.dispatcher.stats().log_summary("수신");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ContentType, Splitter};
    use crate::crypto::SymmetricKey;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cipher() -> CipherStrategy {
        CipherStrategy::Symmetric(SymmetricKey::from_secret(b"secret"))
    }

    fn encoded(name: &str, data: &[u8], transfer_id: &str, size: usize) -> Vec<Vec<u8>> {
        Splitter::new(cipher(), size)
            .split(data, transfer_id, &ContentType::File(name.into()))
            .unwrap()
            .iter()
            .map(|s| s.encode())
            .collect()
    }

    fn context_bytes(job_id: i64, files: &[&str], directory: &str) -> Vec<u8> {
        TransferContext::new(job_id, files.iter().map(|f| f.to_string()).collect(), directory)
            .to_bytes()
            .unwrap()
    }

    #[derive(Clone, Default)]
    struct CountingHook {
        calls: Arc<AtomicUsize>,
    }

    impl CloseHook for CountingHook {
        fn on_close<'a>(&'a self, marker: &'a Path) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async move {
                assert!(marker.exists());
                self.calls.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn test_file_without_context_goes_to_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = Dispatcher::new(cipher(), dir.path());

        let mut last = None;
        for bytes in encoded("report.txt", b"all green", "t1", 4) {
            last = Some(dispatcher.handle(&bytes).await);
        }

        assert!(matches!(last, Some(Outcome::FileWritten { job_id: None, closed: false, .. })));
        assert_eq!(std::fs::read(dir.path().join("report.txt")).unwrap(), b"all green");
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = Dispatcher::new(cipher(), dir.path());

        dispatcher.handle(&context_bytes(5, &["expected.txt"], "out")).await;
        let outcome = dispatcher
            .handle(&encoded("intruder.txt", b"nope", "t1", 100)[0])
            .await;

        assert!(matches!(outcome, Outcome::Rejected(Error::UnexpectedFile { job_id: 5, .. })));
        assert!(!dir.path().join("out").join("intruder.txt").exists());
        assert!(!dir.path().join("intruder.txt").exists());
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(dispatcher.stats().files_rejected, 1);
    }

    #[tokio::test]
    async fn test_closure_runs_hook_once() {
        let dir = tempfile::tempdir().unwrap();
        let hook = CountingHook::default();
        let mut dispatcher =
            Dispatcher::new(cipher(), dir.path()).with_hook(Box::new(hook.clone()));

        dispatcher.handle(&context_bytes(9, &["a", "b"], "out")).await;

        let a = encoded("a", b"first", "ta", 100);
        let b = encoded("b", b"second", "tb", 100);

        let outcome = dispatcher.handle(&a[0]).await;
        assert!(matches!(outcome, Outcome::FileWritten { closed: false, .. }));
        assert!(!dispatcher.context(9).unwrap().closed);

        let outcome = dispatcher.handle(&b[0]).await;
        assert!(matches!(outcome, Outcome::FileWritten { closed: true, .. }));
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert!(dispatcher.context(9).is_none());

        // 마커 파일에 닫힌 컨텍스트 스냅샷
        let marker: TransferContext =
            serde_json::from_slice(&std::fs::read(dir.path().join("9.json")).unwrap()).unwrap();
        assert!(marker.closed);
        assert!(marker.received_files.values().all(|&r| r));

        // 완료 후 중복 세그먼트
        let outcome = dispatcher.handle(&b[0]).await;
        assert!(matches!(outcome, Outcome::Duplicate { .. }));
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().closed_contexts, 1);
    }

    #[tokio::test]
    async fn test_context_replacement_discards_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = Dispatcher::new(cipher(), dir.path());

        dispatcher.handle(&context_bytes(42, &["a", "b"], "out")).await;
        dispatcher.handle(&encoded("a", b"old a", "t1", 100)[0]).await;
        assert!(dir.path().join("out").join("a").exists());

        let outcome = dispatcher.handle(&context_bytes(42, &["a", "b"], "out")).await;
        assert!(matches!(outcome, Outcome::ContextOpened { job_id: 42, replaced: true }));

        let context = dispatcher.context(42).unwrap();
        assert!(!context.is_received("a"));
        assert!(!context.is_received("b"));
        assert!(!dir.path().join("out").join("a").exists());
        assert_eq!(dispatcher.stats().replaced_contexts, 1);
    }

    #[tokio::test]
    async fn test_decryption_failure_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let wrong = CipherStrategy::Symmetric(SymmetricKey::from_secret(b"other"));
        let mut dispatcher = Dispatcher::new(wrong, dir.path());

        let outcome = dispatcher.handle(&encoded("f", b"data", "t1", 100)[0]).await;
        assert!(matches!(outcome, Outcome::Rejected(Error::DecryptionFailed { .. })));
        assert_eq!(dispatcher.stats().decrypt_failures, 1);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn test_from_config_registers_command_hook() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            work_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        assert!(Dispatcher::from_config(&config, cipher()).hook.is_none());

        config.hook = Some("/usr/local/bin/on-close".into());
        assert!(Dispatcher::from_config(&config, cipher()).hook.is_some());
    }

    #[tokio::test]
    async fn test_decryption_failure_abandons_batch() {
        let dir = tempfile::tempdir().unwrap();
        let wrong = CipherStrategy::Symmetric(SymmetricKey::from_secret(b"other"));
        let hook = CountingHook::default();
        let mut dispatcher = Dispatcher::new(wrong, dir.path()).with_hook(Box::new(hook.clone()));

        dispatcher.handle(&context_bytes(9, &["f"], "out")).await;
        let outcome = dispatcher.handle(&encoded("f", b"data", "t1", 100)[0]).await;

        assert!(matches!(outcome, Outcome::Rejected(Error::DecryptionFailed { .. })));
        assert!(dispatcher.context(9).is_none());
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("9.json").exists());
    }

    #[tokio::test]
    async fn test_interleaved_batches_match_declaring_context() {
        let dir = tempfile::tempdir().unwrap();
        let hook = CountingHook::default();
        let mut dispatcher =
            Dispatcher::new(cipher(), dir.path()).with_hook(Box::new(hook.clone()));

        dispatcher.handle(&context_bytes(1, &["a"], "one")).await;
        dispatcher.handle(&context_bytes(2, &["b"], "two")).await;

        // job 2가 가장 최근이지만 "a"는 job 1이 선언
        let outcome = dispatcher.handle(&encoded("a", b"first", "ta", 100)[0]).await;
        assert!(matches!(outcome, Outcome::FileWritten { job_id: Some(1), closed: true, .. }));
        assert_eq!(std::fs::read(dir.path().join("one").join("a")).unwrap(), b"first");
        assert!(dispatcher.context(1).is_none());

        let outcome = dispatcher.handle(&encoded("b", b"second", "tb", 100)[0]).await;
        assert!(matches!(outcome, Outcome::FileWritten { job_id: Some(2), closed: true, .. }));
        assert!(dispatcher.context(2).is_none());
        assert_eq!(hook.calls.load(Ordering::SeqCst), 2);

        // 아무도 선언하지 않은 파일은 열린 컨텍스트가 있으면 거부
        dispatcher.handle(&context_bytes(3, &["c"], "three")).await;
        let outcome = dispatcher.handle(&encoded("z", b"?", "tz", 100)[0]).await;
        assert!(matches!(outcome, Outcome::Rejected(Error::UnexpectedFile { job_id: 3, .. })));
    }

    #[tokio::test]
    async fn test_context_outside_work_dir_ignored() {
        let root = tempfile::tempdir().unwrap();
        let work = root.path().join("work");
        std::fs::create_dir(&work).unwrap();
        let mut dispatcher = Dispatcher::new(cipher(), &work);

        let outcome = dispatcher.handle(&context_bytes(1, &["f"], "../escaped")).await;
        assert!(matches!(outcome, Outcome::Ignored(_)));
        let absolute = root.path().join("abs").display().to_string();
        let outcome = dispatcher.handle(&context_bytes(2, &["f"], &absolute)).await;
        assert!(matches!(outcome, Outcome::Ignored(_)));
        let outcome = dispatcher.handle(&context_bytes(3, &["../f"], "out")).await;
        assert!(matches!(outcome, Outcome::Ignored(_)));
        assert!(dispatcher.context(1).is_none());
        assert!(dispatcher.context(2).is_none());
        assert!(dispatcher.context(3).is_none());

        let outcome = dispatcher.handle(&encoded("f", b"data", "t1", 100)[0]).await;
        assert!(matches!(outcome, Outcome::FileWritten { job_id: None, .. }));
        assert!(work.join("f").exists());
        assert!(!root.path().join("escaped").exists());
        assert!(!root.path().join("abs").exists());

        // 하위 디렉터리는 허용
        let outcome = dispatcher.handle(&context_bytes(4, &["g"], "nested/./out")).await;
        assert!(matches!(outcome, Outcome::ContextOpened { job_id: 4, .. }));
    }

    #[tokio::test]
    async fn test_malformed_and_opaque_do_not_stop_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = Dispatcher::new(cipher(), dir.path());

        assert!(matches!(dispatcher.handle(b"!!CDS!!\xff\xff").await, Outcome::Rejected(_)));
        assert!(matches!(dispatcher.handle(b"worker started").await, Outcome::Opaque));

        let outcome = dispatcher.handle(&encoded("ok", b"fine", "t1", 100)[0]).await;
        assert!(matches!(outcome, Outcome::FileWritten { .. }));
        assert_eq!(dispatcher.stats().malformed_segments, 1);
        assert_eq!(dispatcher.stats().opaque_messages, 1);
    }

    #[tokio::test]
    async fn test_stale_transfers_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher =
            Dispatcher::new(cipher(), dir.path()).with_max_age(Some(Duration::from_millis(10)));

        let segments = encoded("big", b"0123456789", "t1", 2);
        dispatcher.handle(&segments[0]).await;
        assert_eq!(dispatcher.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(dispatcher.evict_stale(), 1);
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(dispatcher.stats().evicted_transfers, 1);
    }

    #[tokio::test]
    async fn test_receiver_rejects_multiple_partitions() {
        let broker = crate::broker::MemoryBroker::new();
        broker.create_topic("jobs", 2);
        let dir = tempfile::tempdir().unwrap();

        let mut receiver = Receiver::new(&broker, "jobs", "g", Dispatcher::new(cipher(), dir.path()));
        let result = receiver.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::MultiPartitionUnsupported { partitions: 2, .. })));
    }

    #[tokio::test]
    async fn test_receiver_commits_each_message_and_stops() {
        let broker = crate::broker::MemoryBroker::new();
        let dir = tempfile::tempdir().unwrap();

        broker.publish("jobs", &context_bytes(1, &["f"], "out")).await.unwrap();
        broker.publish("jobs", b"diagnostic").await.unwrap();
        for bytes in encoded("f", b"content", "t1", 3) {
            broker.publish("jobs", &bytes).await.unwrap();
        }
        let total = broker.len("jobs", 0);

        let cancel = CancellationToken::new();
        let mut receiver = Receiver::new(&broker, "jobs", "g", Dispatcher::new(cipher(), dir.path()));

        let stopper = cancel.clone();
        let watcher = broker.clone();
        tokio::spawn(async move {
            while watcher.committed("g", "jobs", 0).await.unwrap() != Some(total) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        receiver.run(cancel).await.unwrap();

        assert_eq!(receiver.state(), ReceiverState::Stopped);
        assert_eq!(broker.committed("g", "jobs", 0).await.unwrap(), Some(total));
        assert_eq!(std::fs::read(dir.path().join("out").join("f")).unwrap(), b"content");
        assert_eq!(receiver.dispatcher().stats().total_messages, total);
    }

    #[tokio::test]
    async fn test_stop_drains_incomplete_transfers() {
        let broker = crate::broker::MemoryBroker::new();
        let dir = tempfile::tempdir().unwrap();

        let segments = encoded("big", b"0123456789", "t1", 2);
        broker.publish("jobs", &segments[0]).await.unwrap();
        broker.publish("jobs", &segments[1]).await.unwrap();

        let cancel = CancellationToken::new();
        let mut receiver = Receiver::new(&broker, "jobs", "g", Dispatcher::new(cipher(), dir.path()));

        let stopper = cancel.clone();
        let watcher = broker.clone();
        tokio::spawn(async move {
            while watcher.committed("g", "jobs", 0).await.unwrap() != Some(2) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        receiver.run(cancel).await.unwrap();

        assert_eq!(receiver.state(), ReceiverState::Stopped);
        assert_eq!(receiver.dispatcher().in_flight(), 0);
        assert!(!dir.path().join("big").exists());
    }
}

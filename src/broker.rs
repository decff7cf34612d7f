//! 브로커 경계
//!
//! 브로커는 파티션 단위로 순서가 보장되는 at-least-once 바이트 메시지 스트림으로만 다룬다.
//! 실제 브로커 클라이언트는 이 트레이트를 구현해 연결한다.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::{Error, Result};

/// 브로커 비동기 반환 타입
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// 파티션에서 읽은 레코드
#[derive(Debug, Clone)]
pub struct Record {
    pub offset: u64,
    pub payload: Bytes,
}

/// 추상 브로커
pub trait Broker: Send + Sync {
    /// 메시지 발행 (브로커가 확인할 때까지 대기)
    fn publish<'a>(&'a self, topic: &'a str, payload: &'a [u8]) -> BrokerFuture<'a, ()>;

    /// 토픽의 파티션 목록
    fn partitions<'a>(&'a self, topic: &'a str) -> BrokerFuture<'a, Vec<u32>>;

    /// `offset` 위치의 레코드를 읽음 (아직 없으면 올 때까지 대기)
    ///
    /// 취소 안전해야 한다: 대기 중 future를 버려도 상태가 남지 않음.
    fn fetch<'a>(&'a self, topic: &'a str, partition: u32, offset: u64) -> BrokerFuture<'a, Record>;

    /// 그룹의 커밋된 오프셋 (다음에 읽을 위치)
    fn committed<'a>(
        &'a self,
        group: &'a str,
        topic: &'a str,
        partition: u32,
    ) -> BrokerFuture<'a, Option<u64>>;

    /// 다음에 읽을 위치 커밋
    fn commit<'a>(
        &'a self,
        group: &'a str,
        topic: &'a str,
        partition: u32,
        offset: u64,
    ) -> BrokerFuture<'a, ()>;
}

/// 단일 파티션 확인
///
/// 파티션이 둘 이상이면 설정 오류로 시작을 거부한다.
pub async fn single_partition(broker: &dyn Broker, topic: &str) -> Result<u32> {
    let partitions = broker.partitions(topic).await?;
    match partitions.as_slice() {
        [] => Err(Error::TopicNotFound(topic.to_string())),
        [partition] => Ok(*partition),
        _ => Err(Error::MultiPartitionUnsupported {
            topic: topic.to_string(),
            partitions: partitions.len(),
        }),
    }
}

/// 파티션 로그
struct PartitionLog {
    records: RwLock<Vec<Bytes>>,
    /// 현재 레코드 수
    len_tx: watch::Sender<u64>,
}

impl PartitionLog {
    fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            records: RwLock::new(Vec::new()),
            len_tx,
        }
    }

    fn append(&self, payload: Bytes) {
        let len = {
            let mut records = self.records.write();
            records.push(payload);
            records.len() as u64
        };
        self.len_tx.send_replace(len);
    }

    fn get(&self, offset: u64) -> Option<Bytes> {
        self.records.read().get(offset as usize).cloned()
    }
}

/// 메모리 브로커 (프로세스 내부)
///
/// 발행은 항상 파티션 0으로 간다. 테스트나 단일 프로세스 연결에 사용.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    /// topic -> 파티션 로그들
    topics: Arc<DashMap<String, Arc<Vec<PartitionLog>>>>,
    /// (group, topic, partition) -> 커밋된 오프셋
    commits: Arc<DashMap<(String, String, u32), u64>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 파티션 수를 지정해 토픽 생성 (이미 있으면 그대로 둠)
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            Arc::new((0..partitions.max(1)).map(|_| PartitionLog::new()).collect())
        });
    }

    fn topic(&self, topic: &str) -> Arc<Vec<PartitionLog>> {
        self.create_topic(topic, 1);
        self.topics
            .get(topic)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// 파티션의 레코드 수
    pub fn len(&self, topic: &str, partition: u32) -> u64 {
        self.topics
            .get(topic)
            .and_then(|t| t.get(partition as usize).map(|p| *p.len_tx.borrow()))
            .unwrap_or(0)
    }

    /// 파티션의 모든 레코드 복사본
    pub fn records(&self, topic: &str, partition: u32) -> Vec<Bytes> {
        self.topics
            .get(topic)
            .and_then(|t| t.get(partition as usize).map(|p| p.records.read().clone()))
            .unwrap_or_default()
    }
}

impl Broker for MemoryBroker {
    fn publish<'a>(&'a self, topic: &'a str, payload: &'a [u8]) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let logs = self.topic(topic);
            let log = logs
                .first()
                .ok_or_else(|| Error::TopicNotFound(topic.to_string()))?;
            log.append(Bytes::copy_from_slice(payload));
            Ok(())
        })
    }

    fn partitions<'a>(&'a self, topic: &'a str) -> BrokerFuture<'a, Vec<u32>> {
        Box::pin(async move {
            let count = self.topic(topic).len() as u32;
            Ok((0..count).collect())
        })
    }

    fn fetch<'a>(&'a self, topic: &'a str, partition: u32, offset: u64) -> BrokerFuture<'a, Record> {
        Box::pin(async move {
            let logs = self.topic(topic);
            let log = logs.get(partition as usize).ok_or_else(|| {
                Error::Broker(format!("파티션 없음: {}/{}", topic, partition))
            })?;

            let mut len_rx = log.len_tx.subscribe();
            len_rx
                .wait_for(|&len| len > offset)
                .await
                .map_err(|_| Error::Broker("파티션 로그 닫힘".into()))?;

            let payload = log
                .get(offset)
                .ok_or_else(|| Error::Broker(format!("오프셋 없음: {}", offset)))?;
            Ok(Record { offset, payload })
        })
    }

    fn committed<'a>(
        &'a self,
        group: &'a str,
        topic: &'a str,
        partition: u32,
    ) -> BrokerFuture<'a, Option<u64>> {
        Box::pin(async move {
            let key = (group.to_string(), topic.to_string(), partition);
            Ok(self.commits.get(&key).map(|o| *o))
        })
    }

    fn commit<'a>(
        &'a self,
        group: &'a str,
        topic: &'a str,
        partition: u32,
        offset: u64,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.commits
                .insert((group.to_string(), topic.to_string(), partition), offset);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_fetch_in_order() {
        let broker = MemoryBroker::new();
        broker.publish("t", b"one").await.unwrap();
        broker.publish("t", b"two").await.unwrap();

        let first = broker.fetch("t", 0, 0).await.unwrap();
        let second = broker.fetch("t", 0, 1).await.unwrap();
        assert_eq!(first.payload.as_ref(), b"one");
        assert_eq!(second.offset, 1);
        assert_eq!(second.payload.as_ref(), b"two");
    }

    #[tokio::test]
    async fn test_fetch_waits_for_publish() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 1);

        let reader = broker.clone();
        let handle = tokio::spawn(async move { reader.fetch("t", 0, 0).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        broker.publish("t", b"late").await.unwrap();
        let record = handle.await.unwrap().unwrap();
        assert_eq!(record.payload.as_ref(), b"late");
    }

    #[tokio::test]
    async fn test_commit_round_trip() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.committed("g", "t", 0).await.unwrap(), None);
        broker.commit("g", "t", 0, 7).await.unwrap();
        assert_eq!(broker.committed("g", "t", 0).await.unwrap(), Some(7));
        assert_eq!(broker.committed("other", "t", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_single_partition_check() {
        let broker = MemoryBroker::new();
        broker.create_topic("one", 1);
        broker.create_topic("many", 3);

        assert_eq!(single_partition(&broker, "one").await.unwrap(), 0);
        assert!(matches!(
            single_partition(&broker, "many").await,
            Err(Error::MultiPartitionUnsupported { partitions: 3, .. })
        ));
    }
}

//! 디렉터리 기반 스풀 브로커
//!
//! 공유 디렉터리(NFS 등)를 브로커처럼 사용한다.
//!
//! ```text
//! <root>/<topic>/partition-<n>.log            레코드 로그 (append-only)
//! <root>/<topic>/<group>.partition-<n>.offset 커밋된 오프셋
//! ```
//!
//! 레코드: len(u32 LE) + crc32(u32 LE) + payload.
//! 한 토픽에는 쓰는 프로세스가 하나여야 한다.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::broker::{Broker, BrokerFuture, Record};
use crate::{Error, Result};

/// 레코드 헤더 크기 (len + crc32)
const RECORD_HEADER_SIZE: u64 = 8;

/// 파티션 인덱스 (레코드 시작 위치)
#[derive(Debug, Default, Clone)]
struct PartitionIndex {
    positions: Vec<u64>,
    scanned_end: u64,
}

/// 스풀 브로커
pub struct SpoolBroker {
    root: PathBuf,
    poll_interval: Duration,
    /// (topic, partition) -> 인덱스
    indexes: Mutex<HashMap<(String, u32), PartitionIndex>>,
    /// 같은 프로세스 안의 동시 발행 직렬화
    write_lock: tokio::sync::Mutex<()>,
}

impl SpoolBroker {
    pub fn new(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            root: root.into(),
            poll_interval,
            indexes: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.root.join(topic)
    }

    fn log_path(&self, topic: &str, partition: u32) -> PathBuf {
        self.topic_dir(topic).join(format!("partition-{}.log", partition))
    }

    fn offset_path(&self, group: &str, topic: &str, partition: u32) -> PathBuf {
        self.topic_dir(topic)
            .join(format!("{}.partition-{}.offset", group, partition))
    }

    /// 파티션 수를 지정해 토픽 생성 (이미 있는 파티션 파일은 건드리지 않음)
    pub async fn create_topic(&self, topic: &str, partitions: u32) -> Result<()> {
        fs::create_dir_all(self.topic_dir(topic)).await?;
        for partition in 0..partitions.max(1) {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path(topic, partition))
                .await?;
        }
        Ok(())
    }

    /// 인덱스 스냅샷 이후에 추가된 레코드 위치 스캔
    ///
    /// 쓰는 중인 (불완전한) 레코드에서 멈춘다.
    async fn scan(&self, topic: &str, partition: u32) -> Result<PartitionIndex> {
        let key = (topic.to_string(), partition);
        let snapshot = self.indexes.lock().get(&key).cloned().unwrap_or_default();

        let mut file = File::open(self.log_path(topic, partition)).await?;
        let file_len = file.metadata().await?.len();

        let mut positions = Vec::new();
        let mut pos = snapshot.scanned_end;
        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        while pos + RECORD_HEADER_SIZE <= file_len {
            file.seek(SeekFrom::Start(pos)).await?;
            file.read_exact(&mut header).await?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
            let end = pos + RECORD_HEADER_SIZE + len;
            if end > file_len {
                break;
            }
            positions.push(pos);
            pos = end;
        }

        let mut indexes = self.indexes.lock();
        let index = indexes.entry(key).or_default();
        if index.scanned_end == snapshot.scanned_end {
            index.positions.extend(positions);
            index.scanned_end = pos;
        }
        Ok(index.clone())
    }

    async fn read_record(&self, topic: &str, partition: u32, position: u64) -> Result<Bytes> {
        let mut file = File::open(self.log_path(topic, partition)).await?;
        file.seek(SeekFrom::Start(position)).await?;

        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        file.read_exact(&mut header).await?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload).await?;

        let actual = crc32fast::hash(&payload);
        if actual != crc {
            return Err(Error::Broker(format!(
                "CRC 불일치: {}/{} @{}: expected {:08X}, got {:08X}",
                topic, partition, position, crc, actual
            )));
        }
        Ok(Bytes::from(payload))
    }
}

impl Broker for SpoolBroker {
    fn publish<'a>(&'a self, topic: &'a str, payload: &'a [u8]) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            fs::create_dir_all(self.topic_dir(topic)).await?;

            let mut record = Vec::with_capacity(RECORD_HEADER_SIZE as usize + payload.len());
            record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            record.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
            record.extend_from_slice(payload);

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path(topic, 0))
                .await?;
            file.write_all(&record).await?;
            file.sync_data().await?;
            Ok(())
        })
    }

    fn partitions<'a>(&'a self, topic: &'a str) -> BrokerFuture<'a, Vec<u32>> {
        Box::pin(async move {
            let dir = self.topic_dir(topic);
            if fs::metadata(&dir).await.is_err() {
                self.create_topic(topic, 1).await?;
            }

            let mut partitions = Vec::new();
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(n) = name
                    .strip_prefix("partition-")
                    .and_then(|rest| rest.strip_suffix(".log"))
                    .and_then(|n| n.parse::<u32>().ok())
                {
                    partitions.push(n);
                }
            }
            partitions.sort_unstable();
            Ok(partitions)
        })
    }

    fn fetch<'a>(&'a self, topic: &'a str, partition: u32, offset: u64) -> BrokerFuture<'a, Record> {
        Box::pin(async move {
            loop {
                let index = self.scan(topic, partition).await?;
                if let Some(&position) = index.positions.get(offset as usize) {
                    let payload = self.read_record(topic, partition, position).await?;
                    return Ok(Record { offset, payload });
                }
                debug!(topic, partition, offset, "레코드 대기");
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }

    fn committed<'a>(
        &'a self,
        group: &'a str,
        topic: &'a str,
        partition: u32,
    ) -> BrokerFuture<'a, Option<u64>> {
        Box::pin(async move {
            match fs::read_to_string(self.offset_path(group, topic, partition)).await {
                Ok(text) => text
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| Error::Broker(format!("잘못된 오프셋 파일: {}", e))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
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
            let path = self.offset_path(group, topic, partition);
            let tmp = path.with_extension("offset.tmp");
            fs::write(&tmp, offset.to_string()).await?;
            fs::rename(&tmp, &path).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(dir: &Path) -> SpoolBroker {
        SpoolBroker::new(dir, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_publish_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        broker.publish("jobs", b"first").await.unwrap();
        broker.publish("jobs", b"").await.unwrap();
        broker.publish("jobs", b"third").await.unwrap();

        assert_eq!(broker.fetch("jobs", 0, 0).await.unwrap().payload.as_ref(), b"first");
        assert!(broker.fetch("jobs", 0, 1).await.unwrap().payload.is_empty());
        assert_eq!(broker.fetch("jobs", 0, 2).await.unwrap().payload.as_ref(), b"third");
    }

    #[tokio::test]
    async fn test_reader_sees_other_instance_writes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = broker(dir.path());
        let reader = broker(dir.path());

        writer.publish("jobs", b"a").await.unwrap();
        assert_eq!(reader.fetch("jobs", 0, 0).await.unwrap().payload.as_ref(), b"a");

        let pending = tokio::spawn(async move { reader.fetch("jobs", 0, 1).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        writer.publish("jobs", b"b").await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap().payload.as_ref(), b"b");
    }

    #[tokio::test]
    async fn test_partitions_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        assert_eq!(broker.partitions("auto").await.unwrap(), vec![0]);

        broker.create_topic("wide", 2).await.unwrap();
        assert_eq!(broker.partitions("wide").await.unwrap(), vec![0, 1]);

        assert_eq!(broker.committed("g", "auto", 0).await.unwrap(), None);
        broker.commit("g", "auto", 0, 12).await.unwrap();
        assert_eq!(broker.committed("g", "auto", 0).await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn test_crc_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());
        broker.publish("jobs", b"payload").await.unwrap();

        let path = dir.path().join("jobs").join("partition-0.log");
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        let fresh = SpoolBroker::new(dir.path(), Duration::from_millis(10));
        assert!(matches!(fresh.fetch("jobs", 0, 0).await, Err(Error::Broker(_))));
    }
}

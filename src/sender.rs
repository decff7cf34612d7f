//! 송신 파이프라인
//!
//! 한 배치의 순서:
//! 1. 전송 컨텍스트 생성
//! 2. 컨텍스트를 JSON 메시지 하나로 발행
//! 3. 파일마다 분할 + 인코딩 후 offset 오름차순으로 발행 (다음 파일 전에 완료)
//!
//! 발행 실패는 배치 전체를 중단하고 즉시 반환한다. 재시도는 호출자가 배치 단위로 한다.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info};

use crate::broker::Broker;
use crate::chunk::{new_transfer_id, ContentType, Splitter, MESSAGE_FILE_NAME};
use crate::crypto::CipherStrategy;
use crate::message::{Ack, TransferContext};
use crate::wire::Segment;
use crate::{Config, Error, Result};

/// 송신자
pub struct Sender<'a> {
    broker: &'a dyn Broker,
    topic: String,
    splitter: Splitter,
}

impl<'a> Sender<'a> {
    pub fn new(broker: &'a dyn Broker, topic: impl Into<String>, splitter: Splitter) -> Self {
        Self {
            broker,
            topic: topic.into(),
            splitter,
        }
    }

    /// 설정의 데이터 토픽과 세그먼트 크기로 생성
    pub fn from_config(broker: &'a dyn Broker, config: &Config, cipher: CipherStrategy) -> Self {
        Self::new(
            broker,
            config.topic.clone(),
            Splitter::new(cipher, config.segment_size),
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 파일 배치 전송
    pub async fn send_files(
        &self,
        job_id: i64,
        directory: &str,
        files: &[PathBuf],
    ) -> Result<TransferContext> {
        self.send_batch(job_id, directory, files, None).await
    }

    /// 자유 텍스트 메시지를 합성 파일 하나로 전송
    pub async fn send_message(
        &self,
        job_id: i64,
        directory: &str,
        text: &[u8],
    ) -> Result<TransferContext> {
        self.send_batch(job_id, directory, &[], Some(text)).await
    }

    /// 파일들과 (선택) 메시지를 한 컨텍스트로 전송
    pub async fn send_batch(
        &self,
        job_id: i64,
        directory: &str,
        files: &[PathBuf],
        message: Option<&[u8]>,
    ) -> Result<TransferContext> {
        let start = Instant::now();

        let mut names = Vec::with_capacity(files.len() + 1);
        for path in files {
            names.push(file_name(path)?);
        }
        if message.is_some() {
            names.push(MESSAGE_FILE_NAME.to_string());
        }

        let mut seen = HashSet::new();
        if let Some(dup) = names.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(Error::InvalidBatch(format!("파일 이름 중복: {}", dup)));
        }
        if names.is_empty() {
            return Err(Error::InvalidBatch("보낼 파일이 없음".into()));
        }

        // 1. 컨텍스트
        let context = TransferContext::new(job_id, names, directory);
        self.publish_context(&context).await?;

        info!(
            job_id,
            topic = %self.topic,
            files = context.files.len(),
            cipher = self.splitter.cipher().name(),
            "컨텍스트 발행"
        );

        // 2. 파일별 세그먼트
        let mut total_bytes = 0usize;
        for (path, name) in files.iter().zip(context.files.iter()) {
            let data = tokio::fs::read(path).await?;
            total_bytes += data.len();
            self.send_payload(&ContentType::File(name.clone()), &data).await?;
        }
        if let Some(text) = message {
            total_bytes += text.len();
            self.send_payload(&ContentType::Message, text).await?;
        }

        info!(
            job_id,
            files = context.files.len(),
            bytes = total_bytes,
            "배치 전송 완료: {:.2}s",
            start.elapsed().as_secs_f64()
        );

        Ok(context)
    }

    /// 컨텍스트 발행 (JSON, 매직 넘버 없음)
    pub async fn publish_context(&self, context: &TransferContext) -> Result<()> {
        let bytes = context.to_bytes()?;
        self.publish(&bytes).await
    }

    /// ACK 발행 (JSON)
    pub async fn publish_ack(&self, ack: &Ack) -> Result<()> {
        let bytes = ack.to_bytes()?;
        self.publish(&bytes).await
    }

    /// 데이터 하나를 분할해 발행, transfer_id 반환
    ///
    /// 빈 데이터는 빈 평문을 암호화한 세그먼트 하나로 보낸다.
    pub async fn send_payload(&self, content_type: &ContentType, data: &[u8]) -> Result<String> {
        let transfer_id = new_transfer_id();

        let segments = if data.is_empty() {
            vec![self.splitter.split_empty(&transfer_id, content_type)?]
        } else {
            self.splitter.split(data, &transfer_id, content_type)?
        };

        self.publish_segments(&segments).await?;

        info!(
            transfer_id = %transfer_id,
            file = content_type.file_name(),
            segments = segments.len(),
            bytes = data.len(),
            "파일 전송 완료"
        );
        Ok(transfer_id)
    }

    /// 세그먼트를 offset 순서대로 발행
    async fn publish_segments(&self, segments: &[Segment]) -> Result<()> {
        for segment in segments {
            self.publish(&segment.encode()).await?;
            debug!(
                transfer_id = %segment.transfer_id,
                offset = segment.offset,
                count = segment.segment_count,
                "세그먼트 발행"
            );
        }
        Ok(())
    }

    async fn publish(&self, bytes: &[u8]) -> Result<()> {
        self.broker
            .publish(&self.topic, bytes)
            .await
            .map_err(|e| Error::PublishFailed {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidBatch(format!("파일 이름 없음: {}", path.display())))
}

//! ACK 교환
//!
//! 작업 실행측은 ResultPublisher로 결과(와 선택적 산출물)를 ACK 토픽에 올리고,
//! 송신측은 AckWaiter로 자기 job_id의 ACK를 기다린다.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{single_partition, Broker, Record};
use crate::chunk::Splitter;
use crate::crypto::CipherStrategy;
use crate::message::{Ack, AckResult, TransferContext};
use crate::receiver::{Dispatcher, Outcome};
use crate::sender::Sender;
use crate::{Config, Error, Result};

/// 결과 발행자
pub struct ResultPublisher<'a> {
    sender: Sender<'a>,
    max_log_size: usize,
}

impl<'a> ResultPublisher<'a> {
    pub fn new(broker: &'a dyn Broker, ack_topic: impl Into<String>, splitter: Splitter) -> Self {
        Self {
            sender: Sender::new(broker, ack_topic, splitter),
            max_log_size: crate::MAX_ACK_LOG_SIZE,
        }
    }

    /// 설정의 ACK 토픽으로 생성
    pub fn from_config(broker: &'a dyn Broker, config: &Config, cipher: CipherStrategy) -> Self {
        let mut publisher = Self::new(
            broker,
            config.ack_topic.clone(),
            Splitter::new(cipher, config.segment_size),
        );
        publisher.max_log_size = config.max_ack_log_size;
        publisher
    }

    /// 결과 발행
    ///
    /// 로그 크기는 아무것도 보내기 전에 검사한다. 산출물이 있으면 같은 job_id의
    /// 배치로 먼저 보내고 ACK를 마지막에 발행한다.
    pub async fn publish(
        &self,
        context: &TransferContext,
        result: AckResult,
        log: Option<Vec<u8>>,
        artifacts: &[PathBuf],
    ) -> Result<Ack> {
        if let Some(log) = &log {
            if log.len() > self.max_log_size {
                return Err(Error::LogTooLarge {
                    size: log.len(),
                    max_size: self.max_log_size,
                });
            }
        }

        if !artifacts.is_empty() {
            self.sender
                .send_files(context.job_id, &context.directory, artifacts)
                .await?;
        }

        let ack = Ack::new(context.clone(), result, log);
        self.sender.publish_ack(&ack).await?;

        info!(
            job_id = ack.job_id(),
            result = ?ack.result,
            artifacts = artifacts.len(),
            topic = %self.sender.topic(),
            "ACK 발행"
        );
        Ok(ack)
    }
}

/// 대기 중 한 번의 select 결과
enum Event {
    Cancelled,
    TimedOut,
    Progress,
    Fetched(Result<Record>),
}

/// ACK 대기자
pub struct AckWaiter<'a> {
    broker: &'a dyn Broker,
    ack_topic: String,
    group: String,
    timeout: Duration,
    progress_interval: Duration,
    dispatcher: Dispatcher,
}

impl<'a> AckWaiter<'a> {
    pub fn new(
        broker: &'a dyn Broker,
        ack_topic: impl Into<String>,
        group: impl Into<String>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            broker,
            ack_topic: ack_topic.into(),
            group: group.into(),
            timeout: Duration::from_millis(10 * 60 * 1000),
            progress_interval: Duration::from_millis(crate::PROGRESS_INTERVAL_MS),
            dispatcher,
        }
    }

    /// 설정의 ACK 토픽, 타임아웃, 작업 디렉터리로 생성
    pub fn from_config(broker: &'a dyn Broker, config: &Config, cipher: CipherStrategy) -> Self {
        let mut waiter = Self::new(
            broker,
            config.ack_topic.clone(),
            config.group.clone(),
            Dispatcher::from_config(config, cipher),
        );
        waiter.timeout = config.ack_timeout();
        waiter.progress_interval = config.progress_interval();
        waiter
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// `job_id`의 ACK 대기
    ///
    /// 다른 job_id의 ACK는 건너뛰고, 산출물 세그먼트는 작업 디렉터리에 기록한다.
    pub async fn wait(&mut self, job_id: i64, cancel: CancellationToken) -> Result<Ack> {
        let broker = self.broker;
        let partition = single_partition(broker, &self.ack_topic).await?;
        let mut offset = broker
            .committed(&self.group, &self.ack_topic, partition)
            .await?
            .unwrap_or(0);

        let started = Instant::now();
        let deadline = sleep_until(started + self.timeout);
        tokio::pin!(deadline);

        let period = self.progress_interval.max(Duration::from_millis(1));
        let mut progress = interval_at(started + period, period);
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(job_id, topic = %self.ack_topic, offset, "ACK 대기 시작");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                _ = &mut deadline => Event::TimedOut,
                _ = progress.tick() => Event::Progress,
                record = broker.fetch(&self.ack_topic, partition, offset) => Event::Fetched(record),
            };

            let record = match event {
                Event::Cancelled => {
                    warn!(job_id, "ACK 대기 중단");
                    return Err(Error::Interrupted);
                }
                Event::TimedOut => {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    warn!(job_id, waited_ms, "ACK 대기 타임아웃");
                    return Err(Error::AckTimeout { job_id, waited_ms });
                }
                Event::Progress => {
                    info!(job_id, "ACK 대기 중: {:.0}s 경과", started.elapsed().as_secs_f64());
                    continue;
                }
                Event::Fetched(record) => record?,
            };

            offset = record.offset + 1;
            let outcome = self.dispatcher.handle(&record.payload).await;
            broker
                .commit(&self.group, &self.ack_topic, partition, offset)
                .await?;

            match outcome {
                Outcome::Ack(ack) if ack.job_id() == job_id => {
                    self.dispatcher.forget(job_id);
                    info!(
                        job_id,
                        result = ?ack.result,
                        "ACK 수신: {:.1}s",
                        started.elapsed().as_secs_f64()
                    );
                    if let Some(log) = &ack.log {
                        info!(job_id, "작업 로그:\n{}", String::from_utf8_lossy(log));
                    }
                    return Ok(ack);
                }
                Outcome::Ack(ack) => {
                    debug!(job_id, other = ack.job_id(), "다른 작업의 ACK 건너뜀");
                }
                outcome => debug!(job_id, ?outcome, "ACK 토픽 메시지 처리"),
            }
        }
    }
}

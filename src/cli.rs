//! 실행 파일 공통 옵션과 초기화

use std::path::PathBuf;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::crypto::{AsymmetricKey, CipherStrategy, SymmetricKey};
use crate::{Config, Result, SpoolBroker};

/// 브로커/토픽 공통 옵션
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// 스풀 브로커 루트 디렉터리
    #[arg(long, env = "JOBRELAY_SPOOL", default_value = "spool")]
    pub spool: PathBuf,

    /// 데이터 토픽
    #[arg(long, env = "JOBRELAY_TOPIC", default_value = "jobrelay")]
    pub topic: String,

    /// ACK 토픽
    #[arg(long, env = "JOBRELAY_ACK_TOPIC", default_value = "jobrelay-ack")]
    pub ack_topic: String,

    /// 컨슈머 그룹
    #[arg(long, env = "JOBRELAY_GROUP", default_value = "jobrelay")]
    pub group: String,

    /// 수신 파일 기록 디렉터리
    #[arg(long, env = "JOBRELAY_WORK_DIR", default_value = ".")]
    pub work_dir: PathBuf,

    /// 세그먼트 페이로드 크기 (바이트)
    #[arg(long, env = "JOBRELAY_SEGMENT_SIZE", default_value_t = crate::DEFAULT_SEGMENT_SIZE)]
    pub segment_size: usize,

    /// 대칭 암호화 비밀값
    #[arg(long, env = "JOBRELAY_SECRET", default_value = "", hide_env_values = true)]
    pub secret: String,

    /// 상세 로그
    #[arg(short, long)]
    pub verbose: bool,
}

impl CommonArgs {
    pub fn config(&self) -> Config {
        Config {
            segment_size: self.segment_size,
            topic: self.topic.clone(),
            ack_topic: self.ack_topic.clone(),
            group: self.group.clone(),
            work_dir: self.work_dir.clone(),
            ..Config::default()
        }
    }

    pub fn broker(&self, config: &Config) -> SpoolBroker {
        SpoolBroker::new(&self.spool, config.poll_interval())
    }

    /// 송신용 전략 (공개키가 있으면 비대칭)
    pub fn sending_cipher(&self, public_key: Option<&str>) -> Result<CipherStrategy> {
        let public_key = public_key.map(AsymmetricKey::public_from_base64).transpose()?;
        if public_key.is_none() && self.secret.is_empty() {
            warn!("비밀값이 비어 있음: 모든 바이트가 0인 키로 암호화");
        }
        Ok(CipherStrategy::select(public_key, self.secret.as_bytes()))
    }

    /// 수신용 전략 (개인키가 있으면 비대칭)
    pub fn receiving_cipher(
        &self,
        private_key: Option<&str>,
        passphrase: Option<&str>,
    ) -> Result<CipherStrategy> {
        match private_key {
            Some(encoded) => {
                let key = AsymmetricKey::private_from_base64(
                    encoded,
                    passphrase.map(str::as_bytes),
                )?;
                Ok(CipherStrategy::Asymmetric(key))
            }
            None => Ok(CipherStrategy::Symmetric(SymmetricKey::from_secret(
                self.secret.as_bytes(),
            ))),
        }
    }
}

/// 로깅 초기화 (RUST_LOG가 있으면 우선)
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

/// Ctrl-C에서 취소되는 토큰
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C 수신: 정지 중");
            token.cancel();
        }
    });
    cancel
}

//! jobrelay 수신자
//!
//! 데이터 토픽을 읽어 파일을 재조립하고, 배치가 완료되면 훅을 실행한다.
//! Ctrl-C로 현재 메시지를 마무리하고 정지한다.
//!
//! 사용법:
//!   jobrelay-listen --work-dir /srv/jobs --hook ./on-complete.sh

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use jobrelay::cli::{cancel_on_ctrl_c, init_logging, CommonArgs};
use jobrelay::Receiver;

#[derive(Debug, Parser)]
#[command(name = "jobrelay-listen", version, about = "브로커에서 잡 산출물 수신")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// 개인키 (base64). 있으면 비대칭 복호화
    #[arg(long, env = "JOBRELAY_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// 개인키 패스프레이즈
    #[arg(long, env = "JOBRELAY_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// 배치 완료 시 실행할 명령 (마커 파일 경로를 인자로 받음)
    #[arg(long, env = "JOBRELAY_HOOK")]
    hook: Option<PathBuf>,

    /// 미완료 전송 최대 보관 시간 (초, 0이면 무제한)
    #[arg(long, default_value_t = 0)]
    max_age: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let mut config = cli.common.config();
    config.hook = cli.hook.clone();
    config.transfer_max_age_ms = cli.max_age * 1000;

    let broker = cli.common.broker(&config);
    let cipher = cli
        .common
        .receiving_cipher(cli.private_key.as_deref(), cli.passphrase.as_deref())?;

    info!(
        spool = %broker.root().display(),
        topic = %config.topic,
        work_dir = %config.work_dir.display(),
        cipher = cipher.name(),
        "jobrelay-listen 시작"
    );

    let mut receiver = Receiver::from_config(&broker, &config, cipher);
    receiver.run(cancel_on_ctrl_c()).await?;

    info!("jobrelay-listen 종료");
    Ok(())
}

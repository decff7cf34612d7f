//! jobrelay 송신자
//!
//! 파일 배치(와 선택적 메시지)를 데이터 토픽으로 보내고, 요청하면 ACK를 기다린다.
//!
//! 사용법:
//!   jobrelay-send --job-id 42 --directory out build.log report.html
//!   jobrelay-send --job-id 42 --directory out --message "build ok" --wait
//!
//! 종료 코드: 전송 실패, ACK 타임아웃, KO 결과면 1

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use jobrelay::cli::{cancel_on_ctrl_c, init_logging, CommonArgs};
use jobrelay::{AckWaiter, Sender};

#[derive(Debug, Parser)]
#[command(name = "jobrelay-send", version, about = "잡 산출물을 브로커로 전송")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// 잡 ID
    #[arg(long)]
    job_id: i64,

    /// 수신측 출력 디렉터리 (작업 디렉터리 기준)
    #[arg(long, default_value = ".")]
    directory: String,

    /// 함께 보낼 자유 텍스트 메시지
    #[arg(long)]
    message: Option<String>,

    /// 수신자 공개키 (base64). 있으면 비대칭 암호화
    #[arg(long, env = "JOBRELAY_PUBLIC_KEY")]
    public_key: Option<String>,

    /// ACK 산출물 복호화용 개인키 (base64)
    #[arg(long, env = "JOBRELAY_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// 개인키 패스프레이즈
    #[arg(long, env = "JOBRELAY_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// 전송 후 ACK 대기
    #[arg(long)]
    wait: bool,

    /// ACK 대기 타임아웃 (초)
    #[arg(long, default_value_t = 600)]
    timeout: u64,

    /// 보낼 파일들
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let mut config = cli.common.config();
    config.ack_timeout_ms = cli.timeout * 1000;
    let broker = cli.common.broker(&config);
    let cipher = cli.common.sending_cipher(cli.public_key.as_deref())?;

    info!(
        job_id = cli.job_id,
        spool = %broker.root().display(),
        topic = %config.topic,
        cipher = cipher.name(),
        "jobrelay-send 시작"
    );

    let sender = Sender::from_config(&broker, &config, cipher);
    let message = cli.message.as_deref().map(str::as_bytes);
    if let Err(e) = sender
        .send_batch(cli.job_id, &cli.directory, &cli.files, message)
        .await
    {
        error!("전송 실패: {}", e);
        return Ok(ExitCode::FAILURE);
    }

    if !cli.wait {
        return Ok(ExitCode::SUCCESS);
    }

    let cipher = cli
        .common
        .receiving_cipher(cli.private_key.as_deref(), cli.passphrase.as_deref())?;
    let mut waiter = AckWaiter::from_config(&broker, &config, cipher);

    match waiter.wait(cli.job_id, cancel_on_ctrl_c()).await {
        Ok(ack) if ack.result.is_ok() => {
            info!(job_id = cli.job_id, "작업 성공");
            Ok(ExitCode::SUCCESS)
        }
        Ok(_) => {
            error!(job_id = cli.job_id, "작업 실패 (KO)");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            error!("ACK 대기 실패: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

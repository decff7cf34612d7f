//! jobrelay ACK 발행
//!
//! 수신측이 잡을 처리한 뒤 결과를 송신측에 회신한다. 마커 파일(`<job_id>.json`)을
//! 그대로 받으므로 종료 훅에서 바로 호출할 수 있다.
//!
//! 사용법:
//!   jobrelay-ack --result ok --log job.log 42.json result.csv

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;

use jobrelay::cli::{init_logging, CommonArgs};
use jobrelay::{AckResult, ResultPublisher, TransferContext};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Outcome {
    Ok,
    Ko,
}

#[derive(Debug, Parser)]
#[command(name = "jobrelay-ack", version, about = "잡 결과를 송신측에 회신")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// 작업 결과
    #[arg(long, value_enum)]
    result: Outcome,

    /// 첨부할 로그 파일
    #[arg(long)]
    log: Option<PathBuf>,

    /// 송신측 공개키 (base64). 있으면 산출물을 비대칭 암호화
    #[arg(long, env = "JOBRELAY_PUBLIC_KEY")]
    public_key: Option<String>,

    /// 컨텍스트 마커 파일
    marker: PathBuf,

    /// 함께 보낼 산출물
    artifacts: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let context: TransferContext = serde_json::from_slice(&tokio::fs::read(&cli.marker).await?)?;
    let log = match &cli.log {
        Some(path) => Some(tokio::fs::read(path).await?),
        None => None,
    };
    let result = match cli.result {
        Outcome::Ok => AckResult::Ok,
        Outcome::Ko => AckResult::Ko,
    };

    let config = cli.common.config();
    let broker = cli.common.broker(&config);
    let cipher = cli.common.sending_cipher(cli.public_key.as_deref())?;

    let publisher = ResultPublisher::from_config(&broker, &config, cipher);
    publisher.publish(&context, result, log, &cli.artifacts).await?;

    info!(job_id = context.job_id, "jobrelay-ack 완료");
    Ok(())
}

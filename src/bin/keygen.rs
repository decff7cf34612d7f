//! jobrelay 키 생성
//!
//! X25519 키쌍을 base64로 출력한다. 패스프레이즈를 주면 개인키를 봉인한다.
//!
//! 사용법:
//!   jobrelay-keygen --out relay
//!   (relay.pub, relay.key 생성)

use std::path::PathBuf;

use clap::Parser;

use jobrelay::crypto::generate_keypair;

#[derive(Debug, Parser)]
#[command(name = "jobrelay-keygen", version, about = "X25519 키쌍 생성")]
struct Cli {
    /// 개인키 봉인용 패스프레이즈
    #[arg(long, env = "JOBRELAY_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// 출력 파일 접두사 (<out>.pub, <out>.key). 없으면 표준 출력
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let pair = generate_keypair(cli.passphrase.as_deref().map(str::as_bytes))?;

    match cli.out {
        Some(prefix) => {
            let public = prefix.with_extension("pub");
            let private = prefix.with_extension("key");
            std::fs::write(&public, format!("{}\n", pair.public))?;
            std::fs::write(&private, format!("{}\n", pair.private))?;
            println!("공개키: {}", public.display());
            println!("개인키: {}", private.display());
        }
        None => {
            println!("public:  {}", pair.public);
            println!("private: {}", pair.private);
        }
    }
    Ok(())
}

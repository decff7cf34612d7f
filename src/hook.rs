//! 컨텍스트 종료 훅

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::process::Command;
use tracing::{info, warn};

/// 컨텍스트 종료 시 호출되는 후처리
///
/// 실패해도 수신 루프는 멈추지 않는다. 구현은 결과를 직접 로그로 남긴다.
pub trait CloseHook: Send + Sync {
    fn on_close<'a>(&'a self, marker: &'a Path) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// 외부 명령 훅: `<command> <marker-file-path>`
#[derive(Debug, Clone)]
pub struct CommandHook {
    command: PathBuf,
}

impl CommandHook {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &Path {
        &self.command
    }
}

impl CloseHook for CommandHook {
    fn on_close<'a>(&'a self, marker: &'a Path) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            info!(hook = %self.command.display(), marker = %marker.display(), "훅 실행");

            let output = match Command::new(&self.command).arg(marker).output().await {
                Ok(output) => output,
                Err(e) => {
                    warn!(hook = %self.command.display(), "훅 실행 실패: {}", e);
                    return;
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stdout.trim().is_empty() {
                info!(hook = %self.command.display(), "stdout: {}", stdout.trim_end());
            }
            if !stderr.trim().is_empty() {
                warn!(hook = %self.command.display(), "stderr: {}", stderr.trim_end());
            }

            if output.status.success() {
                info!(hook = %self.command.display(), "훅 완료");
            } else {
                warn!(hook = %self.command.display(), status = %output.status, "훅 비정상 종료");
            }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_command_path_kept() {
        let hook = CommandHook::new("/usr/local/bin/on-close");
        assert_eq!(hook.command(), Path::new("/usr/local/bin/on-close"));
    }

    #[tokio::test]
    async fn test_command_hook_receives_marker_path() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("42.json");

        // touch가 인자로 받은 경로에 파일을 만들면 마커 경로가 전달된 것
        CommandHook::new("touch").on_close(&marker).await;
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_panic() {
        CommandHook::new("false").on_close(Path::new("/tmp/none.json")).await;
        CommandHook::new("/nonexistent/hook").on_close(Path::new("/tmp/none.json")).await;
    }
}

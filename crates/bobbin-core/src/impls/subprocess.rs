//! SubprocessLauncher - Actor を独立した OS プロセスとして起動する
//!
//! 起動コマンド: `<program> <base_args...> actor --item-type <type> [--arg key=value]...`
//!
//! 子プロセスは Orchestrator から独立している。ハンドルを drop しても kill されず、
//! 各 Actor は自分の idle タイムアウトで終了する。

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::domain::LaunchError;
use crate::ports::{ActorLauncher, ActorProcess, LaunchArgs};

#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    program: PathBuf,
    base_args: Vec<String>,
}

impl SubprocessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    /// 実行中のバイナリ自身を起動する
    pub fn current_exe() -> Result<Self, LaunchError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// サブコマンドの前に付ける引数（`--db path` など）
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.base_args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// 起動時に渡す引数列（テスト用に公開）
    pub fn command_args(&self, args: &LaunchArgs) -> Vec<String> {
        let mut argv = self.base_args.clone();
        argv.push("actor".to_string());
        argv.push("--item-type".to_string());
        argv.push(args.item_type.to_string());
        for (key, value) in &args.extra {
            argv.push("--arg".to_string());
            argv.push(format!("{key}={value}"));
        }
        argv
    }
}

#[async_trait]
impl ActorLauncher for SubprocessLauncher {
    async fn launch(&self, args: &LaunchArgs) -> Result<Box<dyn ActorProcess>, LaunchError> {
        let argv = self.command_args(args);
        let child = Command::new(&self.program)
            .args(&argv)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| LaunchError::NoPid(args.item_type.clone()))?;
        debug!(
            program = %self.program.display(),
            argv = ?argv,
            pid,
            "spawned actor process"
        );
        Ok(Box::new(SubprocessActor { pid, child }))
    }
}

pub struct SubprocessActor {
    pid: u32,
    child: Child,
}

impl ActorProcess for SubprocessActor {
    fn id(&self) -> u32 {
        self.pid
    }

    fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid = self.pid, %status, "actor process exited");
                false
            }
            Err(e) => {
                warn!(pid = self.pid, error = %e, "failed to poll actor process");
                false
            }
        }
    }
}

//! Interactive Shell - 交互式进程会话
//!
//! 每个会话至多持有一个存活子进程 (`/bin/bash -c <command>`)：
//! - stdout/stderr 由后台任务读取并经 channel 送入会话缓冲
//! - spawn 会先结束旧进程，等待 settle 窗口后返回已累积输出
//! - read 为一次性消费

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SHELL: &str = "/bin/bash";

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("No active process")]
    NoProcess,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 交互式进程会话
#[derive(Debug)]
pub struct InteractiveShell {
    workspace_root: PathBuf,
    settle: Duration,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    output_rx: Option<mpsc::UnboundedReceiver<String>>,
    readers: Vec<JoinHandle<()>>,
    buffer: String,
    command: Option<String>,
}

impl InteractiveShell {
    pub fn new(workspace_root: impl Into<PathBuf>, settle: Duration) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            settle,
            child: None,
            stdin: None,
            output_rx: None,
            readers: Vec::new(),
            buffer: String::new(),
            command: None,
        }
    }

    /// 当前 (或最近一次) 运行的命令
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// 启动新进程并返回 settle 窗口内的输出
    pub async fn spawn(&mut self, command: &str) -> Result<String, ShellError> {
        self.kill().await?;
        self.buffer.clear();

        let mut child = Command::new(SHELL)
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ShellError::Spawn(format!("{command}: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            self.readers.push(tokio::spawn(forward_output(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers.push(tokio::spawn(forward_output(stderr, tx)));
        }

        info!(command, pid = ?child.id(), "Spawned interactive process");
        self.stdin = child.stdin.take();
        self.child = Some(child);
        self.output_rx = Some(rx);
        self.command = Some(command.to_string());

        Ok(self.settle().await)
    }

    /// 向进程 stdin 写入 (原样写入，不追加换行)
    pub async fn write(&mut self, input: &str) -> Result<(), ShellError> {
        if !self.is_alive() {
            return Err(ShellError::NoProcess);
        }
        let stdin = self.stdin.as_mut().ok_or(ShellError::NoProcess)?;
        stdin.write_all(input.as_bytes()).await?;
        stdin.flush().await?;
        debug!(bytes = input.len(), "Wrote to interactive process");
        Ok(())
    }

    /// 等待 settle 窗口后读取
    pub async fn settle(&mut self) -> String {
        tokio::time::sleep(self.settle).await;
        self.read()
    }

    /// 取走累积输出
    pub fn read(&mut self) -> String {
        if let Some(rx) = self.output_rx.as_mut() {
            while let Ok(chunk) = rx.try_recv() {
                self.buffer.push_str(&chunk);
            }
        }
        std::mem::take(&mut self.buffer)
    }

    /// 结束进程；无进程时为 no-op，返回是否确有进程被结束
    ///
    /// 先结束进程再关闭 stdin：读 stdin 的进程遇到 EOF 会自行退出
    pub async fn kill(&mut self) -> Result<bool, ShellError> {
        let killed = match self.child.take() {
            None => false,
            Some(mut child) => match child.try_wait() {
                Ok(Some(_)) => false,
                _ => {
                    if let Err(e) = child.kill().await {
                        // 进程已退出时 kill 会报 InvalidInput
                        if e.kind() != std::io::ErrorKind::InvalidInput {
                            self.release_pipes();
                            return Err(e.into());
                        }
                    }
                    info!(command = ?self.command, "Killed interactive process");
                    true
                }
            },
        };
        self.release_pipes();
        Ok(killed)
    }

    fn release_pipes(&mut self) {
        self.stdin = None;
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.output_rx = None;
    }

    /// 进程是否存活；已退出的进程被回收
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(?status, command = ?self.command, "Interactive process exited");
                self.child = None;
                self.stdin = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to poll interactive process");
                false
            }
        }
    }
}

async fn forward_output<R: AsyncRead + Unpin>(mut source: R, tx: mpsc::UnboundedSender<String>) {
    let mut buf = [0u8; 4096];
    // 跨两次 read 的多字节字符的前半部分
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8_prefix(&mut pending);
                if !text.is_empty() && tx.send(text).is_err() {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

/// 解码可完整解码的前缀；末尾不完整的字符留在 `pending` 中
fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                // valid 之前的字节已验证
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                }
            }
        }
    }
}

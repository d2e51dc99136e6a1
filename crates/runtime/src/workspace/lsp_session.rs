//! LSP Session - 语言服务器会话
//!
//! 职责：
//! - 懒启动语言服务器并完成 initialize / initialized 握手
//! - JSON-RPC 请求/响应 (Content-Length 分帧)
//! - 文档内容经 Shadow Store 读取 (暂存优先)，首次查询前 didOpen，内容变化后 didChange
//! - definition / references / documentSymbol / hover 查询
//!
//! 架构：
//! - writer 任务独占 stdin，所有出站消息经 mpsc 发送
//! - reader 任务解析入站消息：响应按 id 派发到 oneshot，服务端请求回复 null

use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::shadow::{ShadowError, ShadowStore};

#[derive(Debug, Error)]
pub enum LspError {
    #[error("LSP command is not configured")]
    NotConfigured,

    #[error("Failed to start language server: {0}")]
    Spawn(String),

    #[error("Language server initialization failed: {0}")]
    Initialize(String),

    #[error("Language server exited")]
    ServerExited,

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Shadow store error: {0}")]
    Shadow(#[from] ShadowError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("LSP error {code}: {message}")]
    Response { code: i64, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 等待响应的请求；reader 结束后 closed 置位，之后的请求立即失败
#[derive(Debug, Default)]
struct PendingRequests {
    waiters: HashMap<i64, oneshot::Sender<Result<Value, LspError>>>,
    closed: bool,
}

type Pending = Arc<Mutex<PendingRequests>>;

/// 已建立的连接
#[derive(Debug)]
struct LspConnection {
    child: Child,
    outbound: mpsc::UnboundedSender<Value>,
    pending: Pending,
    next_id: i64,
    tasks: Vec<JoinHandle<()>>,
}

/// 服务端已知的文档版本
#[derive(Debug, Clone)]
struct OpenDocument {
    version: i64,
    text: String,
}

/// 语言服务器会话
#[derive(Debug)]
pub struct LspSession {
    command: Vec<String>,
    workspace_root: PathBuf,
    shadow: Option<Arc<ShadowStore>>,
    connection: Option<LspConnection>,
    opened: HashMap<PathBuf, OpenDocument>,
}

impl LspSession {
    pub fn new(workspace_root: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            command,
            workspace_root: workspace_root.into(),
            shadow: None,
            connection: None,
            opened: HashMap::new(),
        }
    }

    /// 经 Shadow Store 读取文档，查询能看到尚未提交的编辑
    pub fn with_shadow(mut self, shadow: Arc<ShadowStore>) -> Self {
        self.shadow = Some(shadow);
        self
    }

    pub fn is_running(&self) -> bool {
        self.connection.is_some()
    }

    /// 跳转定义 (0-indexed)
    pub async fn definition(&mut self, path: &str, line: u32, character: u32) -> Result<Value, LspError> {
        let uri = self.open_document(path).await?;
        self.request("textDocument/definition", position_params(&uri, line, character))
            .await
    }

    /// 查找引用 (含声明)
    pub async fn references(&mut self, path: &str, line: u32, character: u32) -> Result<Value, LspError> {
        let uri = self.open_document(path).await?;
        let mut params = position_params(&uri, line, character);
        params["context"] = json!({ "includeDeclaration": true });
        self.request("textDocument/references", params).await
    }

    /// 文档符号
    pub async fn symbols(&mut self, path: &str) -> Result<Value, LspError> {
        let uri = self.open_document(path).await?;
        self.request(
            "textDocument/documentSymbol",
            json!({ "textDocument": { "uri": uri } }),
        )
        .await
    }

    /// 悬停信息
    pub async fn hover(&mut self, path: &str, line: u32, character: u32) -> Result<Value, LspError> {
        let uri = self.open_document(path).await?;
        self.request("textDocument/hover", position_params(&uri, line, character))
            .await
    }

    /// 关闭会话；从未启动时安全
    pub async fn stop(&mut self) {
        self.opened.clear();
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        for task in connection.tasks.drain(..) {
            task.abort();
        }
        connection.pending.lock().await.waiters.clear();
        if let Err(e) = connection.child.kill().await {
            debug!(error = %e, "Language server already gone");
        }
        info!("Language server stopped");
    }

    async fn ensure_started(&mut self) -> Result<(), LspError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let (program, args) = self.command.split_first().ok_or(LspError::NotConfigured)?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LspError::Spawn(format!("{program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::Spawn("stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::Spawn("stdout unavailable".to_string()))?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::default();
        let tasks = vec![
            tokio::spawn(write_loop(stdin, outbound_rx)),
            tokio::spawn(read_loop(
                BufReader::new(stdout),
                pending.clone(),
                outbound.clone(),
            )),
        ];

        info!(command = ?self.command, pid = ?child.id(), "Language server started");
        self.connection = Some(LspConnection {
            child,
            outbound,
            pending,
            next_id: 1,
            tasks,
        });

        if let Err(e) = self.initialize().await {
            warn!(error = %e, "Language server initialization failed");
            self.stop().await;
            return Err(LspError::Initialize(e.to_string()));
        }
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), LspError> {
        let root_uri = file_uri(&self.workspace_root);
        let name = self
            .workspace_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string());
        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "workspaceFolders": [{ "uri": root_uri, "name": name }],
            "capabilities": {
                "textDocument": {
                    "definition": { "linkSupport": false },
                    "references": {},
                    "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
                    "hover": { "contentFormat": ["plaintext", "markdown"] }
                }
            }
        });
        self.call("initialize", params).await?;
        self.notify("initialized", json!({}))?;
        debug!("Language server initialized");
        Ok(())
    }

    async fn open_document(&mut self, path: &str) -> Result<String, LspError> {
        self.ensure_started().await?;
        let absolute = self.workspace_root.join(path);
        let uri = file_uri(&absolute);
        let text = self.current_text(path).await?;
        if let Some((method, params)) = self.sync_notification(&absolute, &uri, text) {
            self.notify(method, params)?;
        }
        Ok(uri)
    }

    /// 文档当前内容：暂存优先，其次磁盘
    async fn current_text(&self, path: &str) -> Result<String, LspError> {
        match &self.shadow {
            Some(shadow) => shadow
                .read(path)
                .await?
                .ok_or_else(|| LspError::DocumentNotFound(path.to_string())),
            None => match tokio::fs::read_to_string(self.workspace_root.join(path)).await {
                Ok(text) => Ok(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(LspError::DocumentNotFound(path.to_string()))
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// 需要发送的同步通知；内容未变时为 None
    fn sync_notification(&mut self, absolute: &Path, uri: &str, text: String) -> Option<(&'static str, Value)> {
        let Some(document) = self.opened.get_mut(absolute) else {
            let params = json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": language_id(absolute),
                    "version": 1,
                    "text": text.as_str()
                }
            });
            self.opened
                .insert(absolute.to_path_buf(), OpenDocument { version: 1, text });
            return Some(("textDocument/didOpen", params));
        };
        if document.text == text {
            return None;
        }
        document.version += 1;
        let params = json!({
            "textDocument": { "uri": uri, "version": document.version },
            "contentChanges": [{ "text": text.as_str() }]
        });
        debug!(uri, version = document.version, "Document changed");
        document.text = text;
        Some(("textDocument/didChange", params))
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, LspError> {
        self.ensure_started().await?;
        self.call(method, params).await
    }

    async fn call(&mut self, method: &str, params: Value) -> Result<Value, LspError> {
        let connection = self.connection.as_mut().ok_or(LspError::ServerExited)?;
        let id = connection.next_id;
        connection.next_id += 1;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = connection.pending.lock().await;
            if pending.closed {
                return Err(LspError::ServerExited);
            }
            pending.waiters.insert(id, tx);
        }
        connection
            .outbound
            .send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .map_err(|_| LspError::ServerExited)?;
        debug!(id, method, "LSP request sent");

        rx.await.map_err(|_| LspError::ServerExited)?
    }

    fn notify(&self, method: &str, params: Value) -> Result<(), LspError> {
        let connection = self.connection.as_ref().ok_or(LspError::ServerExited)?;
        connection
            .outbound
            .send(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .map_err(|_| LspError::ServerExited)
    }
}

fn position_params(uri: &str, line: u32, character: u32) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character }
    })
}

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display()).replace(' ', "%20")
}

fn language_id(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or_default() {
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "js" => "javascript",
        "jsx" => "javascriptreact",
        "rs" => "rust",
        "py" => "python",
        "go" => "go",
        "json" => "json",
        "md" => "markdown",
        "css" => "css",
        "scss" => "scss",
        _ => "plaintext",
    }
}

/// 编码一帧 `Content-Length: N\r\n\r\n<body>`
pub(crate) fn encode_frame(message: &Value) -> Vec<u8> {
    let body = message.to_string();
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(body.as_bytes());
    frame
}

/// 读取一帧；流结束时返回 None
pub(crate) async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Value>, LspError> {
    let mut content_length: Option<usize> = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let header = line.trim_end();
        if header.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some((key, value)) = header.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                let length = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| LspError::Protocol(format!("bad Content-Length: {e}")))?;
                content_length = Some(length);
            }
        }
    }

    let length = content_length.unwrap_or_default();
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

async fn write_loop(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = rx.recv().await {
        let frame = encode_frame(&message);
        if let Err(e) = stdin.write_all(&frame).await {
            warn!(error = %e, "Failed to write to language server");
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn read_loop<R: AsyncBufRead + Unpin>(
    mut reader: R,
    pending: Pending,
    outbound: mpsc::UnboundedSender<Value>,
) {
    loop {
        let message = match read_frame(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from language server");
                break;
            }
        };

        let id = message.get("id").cloned();
        let method = message.get("method").and_then(Value::as_str);
        match (id, method) {
            // 服务端发起的请求 (如 workspace/configuration)
            (Some(id), Some(method)) => {
                debug!(method, "Replying null to server request");
                let _ = outbound.send(json!({ "jsonrpc": "2.0", "id": id, "result": Value::Null }));
            }
            (Some(id), None) => {
                let Some(id) = id.as_i64() else {
                    continue;
                };
                if let Some(tx) = pending.lock().await.waiters.remove(&id) {
                    let _ = tx.send(response_result(message));
                }
            }
            (None, Some(method)) => debug!(method, "Server notification"),
            (None, None) => {}
        }
    }
    // 丢弃未完成的请求，调用方收到 ServerExited
    let mut pending = pending.lock().await;
    pending.closed = true;
    pending.waiters.clear();
}

fn response_result(mut message: Value) -> Result<Value, LspError> {
    if let Some(error) = message.get("error") {
        return Err(LspError::Response {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    Ok(message
        .get_mut("result")
        .map(Value::take)
        .unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let message = json!({ "jsonrpc": "2.0", "id": 7, "result": { "ok": true } });
        let mut bytes = encode_frame(&message);
        bytes.extend(encode_frame(&json!({ "jsonrpc": "2.0", "method": "x" })));

        let mut reader: &[u8] = &bytes;
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(message));
        assert!(read_frame(&mut reader).await.unwrap().is_some());
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_headers_are_case_insensitive() {
        let body = r#"{"id":1,"result":null}"#;
        let raw = format!(
            "content-length: {}\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{}",
            body.len(),
            body
        );
        let mut reader: &[u8] = raw.as_bytes();
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame["id"], 1);
    }

    #[test]
    fn test_response_error_is_surfaced() {
        let result = response_result(json!({ "id": 1, "error": { "code": -32601, "message": "nope" } }));
        assert!(matches!(result, Err(LspError::Response { code: -32601, .. })));
        assert_eq!(response_result(json!({ "id": 1 })).unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_read_loop_dispatches_responses_and_answers_server_requests() {
        let mut bytes = encode_frame(&json!({ "jsonrpc": "2.0", "id": 3, "method": "workspace/configuration" }));
        bytes.extend(encode_frame(&json!({ "jsonrpc": "2.0", "id": 1, "result": [1, 2] })));

        let pending: Pending = Arc::default();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.waiters.insert(1, tx);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        read_loop(&bytes[..], pending.clone(), out_tx).await;

        assert_eq!(rx.await.unwrap().unwrap(), json!([1, 2]));
        let reply = out_rx.recv().await.unwrap();
        assert_eq!(reply["id"], 3);
        assert!(reply["result"].is_null());
        assert!(pending.lock().await.closed);
    }

    #[tokio::test]
    async fn test_stop_when_never_started_is_safe() {
        let dir = TempDir::new().unwrap();
        let mut session = LspSession::new(dir.path(), vec!["does-not-matter".into()]);
        session.stop().await;
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure_propagates_to_query() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.ts"), "export const a = 1;").unwrap();
        let mut session = LspSession::new(dir.path(), vec!["octo-no-such-language-server".into()]);

        let result = session.hover("a.ts", 0, 13).await;
        assert!(matches!(result, Err(LspError::Spawn(_))));
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_server_exit_during_initialize_fails_query() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.ts"), "export const a = 1;").unwrap();
        let mut session = LspSession::new(dir.path(), vec!["true".into()]);

        let result = session.symbols("a.ts").await;
        assert!(matches!(result, Err(LspError::Initialize(_))));
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_empty_command_is_not_configured() {
        let dir = TempDir::new().unwrap();
        let mut session = LspSession::new(dir.path(), Vec::new());
        assert!(matches!(
            session.definition("a.ts", 0, 0).await,
            Err(LspError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_document_text_comes_from_staged_content() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.ts"), "export const a = 1;").unwrap();
        let shadow = Arc::new(ShadowStore::new(dir.path()));
        let session = LspSession::new(dir.path(), Vec::new()).with_shadow(shadow.clone());

        assert_eq!(session.current_text("a.ts").await.unwrap(), "export const a = 1;");
        shadow.write("a.ts", "export const a = 2;").await.unwrap();
        assert_eq!(session.current_text("a.ts").await.unwrap(), "export const a = 2;");
        assert!(matches!(
            session.current_text("missing.ts").await,
            Err(LspError::DocumentNotFound(_))
        ));
    }

    #[test]
    fn test_sync_sends_open_then_change_on_new_content() {
        let dir = TempDir::new().unwrap();
        let mut session = LspSession::new(dir.path(), Vec::new());
        let path = dir.path().join("a.rs");
        let uri = file_uri(&path);

        let (method, params) = session.sync_notification(&path, &uri, "fn a() {}".into()).unwrap();
        assert_eq!(method, "textDocument/didOpen");
        assert_eq!(params["textDocument"]["languageId"], "rust");
        assert_eq!(params["textDocument"]["version"], 1);

        assert!(session.sync_notification(&path, &uri, "fn a() {}".into()).is_none());

        let (method, params) = session.sync_notification(&path, &uri, "fn b() {}".into()).unwrap();
        assert_eq!(method, "textDocument/didChange");
        assert_eq!(params["textDocument"]["version"], 2);
        assert_eq!(params["contentChanges"][0]["text"], "fn b() {}");

        // stop 之后服务端状态重置，重新 didOpen
        session.opened.clear();
        let (method, _) = session.sync_notification(&path, &uri, "fn b() {}".into()).unwrap();
        assert_eq!(method, "textDocument/didOpen");
    }
}

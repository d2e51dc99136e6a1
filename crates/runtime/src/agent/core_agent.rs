//! Core Agent - plan → act → observe 控制循环
//!
//! 职责：
//! - 工作区索引引导 (idle → indexing → idle)
//! - 目标执行循环 (idle → planning → acting → observing → … → idle)
//! - 工具调用记入 Flow，成功结果进入对话记忆，失败只进入 Telemetry
//! - 周期性会话检查点
//! - 退出时 (含 panic) 释放终端与语言服务器会话
//!
//! 状态变更经 broadcast 发布，当前状态经 watch 暴露。

use futures::FutureExt;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, error, info, warn};

use octo_cognition::{
    load_fingerprints, save_fingerprints, IndexError, SearchResult, WorkspaceIndexer, METADATA_FILE,
    VECTOR_STORE_FILE,
};
use octo_core::{
    AgentStatus, ConversationalMemory, FlowEntry, FlowEntryId, FlowPromptInput, FlowStore, FlowSurface,
    GenerationRequest, GenerationResponse, MemoryRole, Message, ModelRoute, PromptFactory, StatusChange,
    SystemPromptOptions, TelemetryEntry, TelemetryKind, TestStatus, TestSurface, TestUpdate,
    looks_like_test_command,
};
use octo_persistence::{SessionMetadata, SessionSnapshot, TokenMetrics};

use super::context::AgentContext;
use super::delegation::SubAgentDelegator;
use super::AgentError;
use crate::tools::{
    BuiltinTool, OutputTruncator, Tool, ToolContext, ToolGroup, ToolRouter, TruncationLevel, builtin_tools,
};
use crate::workspace::{InteractiveShell, LspSession};

const STATUS_CHANNEL_CAPACITY: usize = 2048;
const CONTEXT_SEPARATOR: &str = "\n---\n";
/// 关联到测试运行的最近编辑动作数
const RELATED_EDIT_LOOKBACK: usize = 10;

/// 一次索引同步的摘要
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub changed_files: usize,
    pub deleted_files: usize,
    pub chunks_added: usize,
    pub total_chunks: usize,
}

/// 供外部 (UI) 在循环运行期间注入人工干预
#[derive(Debug, Clone)]
pub struct InterventionHandle {
    flow: Arc<Mutex<FlowStore>>,
}

impl InterventionHandle {
    pub async fn intervene(&self, content: impl Into<String>) -> FlowEntryId {
        self.flow
            .lock()
            .await
            .append(FlowEntry::human_intervention(content))
    }
}

/// 单个工具调用的结果
enum CallOutcome {
    Success(String),
    Failure(String),
}

pub struct CoreAgent {
    context: AgentContext,
    persona: Option<String>,
    depth: u32,
    session_id: String,
    flow: Arc<Mutex<FlowStore>>,
    memory: ConversationalMemory,
    tests: TestSurface,
    shell: Arc<Mutex<InteractiveShell>>,
    lsp: Arc<Mutex<LspSession>>,
    router: ToolRouter,
    prompts: PromptFactory,
    truncator: OutputTruncator,
    status_tx: watch::Sender<AgentStatus>,
    events: broadcast::Sender<StatusChange>,
    token_metrics: TokenMetrics,
    iterations: u32,
    last_text: String,
}

impl std::fmt::Debug for CoreAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreAgent")
            .field("session_id", &self.session_id)
            .field("persona", &self.persona)
            .field("depth", &self.depth)
            .field("status", &self.status())
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl CoreAgent {
    /// 构造 Agent；`depth` 达到委派上限时拒绝
    pub fn new(context: AgentContext, persona: Option<String>, depth: u32) -> Result<Self, AgentError> {
        let config = context.config.clone();
        let max = config.agent.max_delegation_depth;
        if depth >= max {
            return Err(AgentError::DelegationDepthExceeded { depth, max });
        }

        let root = context.workspace_root.clone();
        let shell = Arc::new(Mutex::new(InteractiveShell::new(
            &root,
            Duration::from_millis(config.process.settle_ms),
        )));
        let lsp = Arc::new(Mutex::new(
            LspSession::new(&root, config.process.lsp_command.clone()).with_shadow(context.shadow.clone()),
        ));

        let tool_context = ToolContext {
            shadow: context.shadow.clone(),
            shell: shell.clone(),
            lsp: lsp.clone(),
            vector_index: context.vector_index.clone(),
            process: config.process.clone(),
            retrieval_top_k: config.agent.retrieval_top_k,
            depth,
            max_delegation_depth: max,
            delegator: Some(Arc::new(SubAgentDelegator::new(context.clone()))),
        };
        let mut router = ToolRouter::new();
        for tool in builtin_tools(&tool_context) {
            router.register(tool);
        }

        let (status_tx, _) = watch::channel(AgentStatus::Idle);
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        let session_id = uuid::Uuid::new_v4().to_string();
        debug!(session = %session_id, depth, persona = ?persona, "Agent created");

        Ok(Self {
            persona,
            depth,
            session_id,
            flow: Arc::new(Mutex::new(FlowStore::new())),
            memory: ConversationalMemory::new(),
            tests: TestSurface::new(),
            shell,
            lsp,
            router,
            prompts: PromptFactory::new(config.agent.observation_truncate_chars),
            truncator: OutputTruncator::new(config.agent.token_warning_threshold),
            status_tx,
            events,
            token_metrics: TokenMetrics::default(),
            iterations: 0,
            last_text: String::new(),
            context,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn persona(&self) -> Option<&str> {
        self.persona.as_deref()
    }

    pub fn status(&self) -> AgentStatus {
        *self.status_tx.borrow()
    }

    /// 订阅状态变更事件
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    /// 当前状态的 watch 通道
    pub fn watch_status(&self) -> watch::Receiver<AgentStatus> {
        self.status_tx.subscribe()
    }

    pub fn memory(&self) -> &ConversationalMemory {
        &self.memory
    }

    pub fn tests(&self) -> &TestSurface {
        &self.tests
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }

    pub(crate) fn shell(&self) -> Arc<Mutex<InteractiveShell>> {
        self.shell.clone()
    }

    pub(crate) fn lsp(&self) -> Arc<Mutex<LspSession>> {
        self.lsp.clone()
    }

    pub fn token_metrics(&self) -> TokenMetrics {
        self.token_metrics
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// 额外注册工具 (重名覆盖内置工具)
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) -> Option<String> {
        self.router.register(tool)
    }

    pub async fn flow_entries(&self) -> Vec<FlowEntry> {
        self.flow.lock().await.entries().to_vec()
    }

    pub fn intervention_handle(&self) -> InterventionHandle {
        InterventionHandle {
            flow: self.flow.clone(),
        }
    }

    /// 记录人工干预 (不受截断影响)
    pub async fn intervene(&self, content: impl Into<String>) -> FlowEntryId {
        self.intervention_handle().intervene(content).await
    }

    fn set_status(&self, to: AgentStatus) {
        let from = self.status_tx.send_replace(to);
        if from == to {
            return;
        }
        debug!(from = %from, to = %to, "Agent status changed");
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(StatusChange {
            from,
            to,
            at: chrono::Utc::now(),
        });
    }

    // ===== 工作区索引 =====

    /// 增量索引工作区；失败只记录日志，状态总会回到 idle
    pub async fn initialize_workspace(&mut self) -> Option<IndexReport> {
        self.set_status(AgentStatus::Indexing);
        let report = match self.sync_index().await {
            Ok(report) => {
                info!(
                    changed = report.changed_files,
                    deleted = report.deleted_files,
                    chunks = report.total_chunks,
                    "Workspace indexing complete"
                );
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "Workspace indexing failed");
                None
            }
        };
        self.set_status(AgentStatus::Idle);
        report
    }

    async fn sync_index(&self) -> Result<IndexReport, IndexError> {
        let state_dir = self.context.state_dir();
        let vector_path = state_dir.join(VECTOR_STORE_FILE);
        let metadata_path = state_dir.join(METADATA_FILE);
        let config = &self.context.config;

        let mut index = self.context.vector_index.write().await;
        let loaded = index.load(&vector_path).await?;
        let mut previous = load_fingerprints(&metadata_path).await;
        if loaded == 0 && !previous.is_empty() {
            // 快照被拒绝或丢失，指纹已不可信，全部重新分块
            warn!(files = previous.len(), "Vector snapshot unusable, reindexing all files");
            previous.clear();
        }

        let indexer = WorkspaceIndexer::new(&config.workspace);
        let result = indexer
            .index_incremental(&self.context.workspace_root, &previous)
            .await?;

        for deleted in &result.deleted_files {
            index.remove_documents(deleted);
        }
        for changed in &result.changed_documents {
            index.remove_documents(&changed.path);
        }
        let chunks_added = index.add_documents(&result.changed_documents).await;

        index.save(&vector_path).await?;
        save_fingerprints(&metadata_path, &result.metadata).await?;

        Ok(IndexReport {
            changed_files: result.changed_documents.len(),
            deleted_files: result.deleted_files.len(),
            chunks_added,
            total_chunks: index.len(),
        })
    }

    /// 语义检索工作区
    pub async fn search_workspace(&self, query: &str) -> Result<Vec<SearchResult>, IndexError> {
        self.context
            .vector_index
            .read()
            .await
            .search(query, self.context.config.agent.retrieval_top_k)
            .await
    }

    // ===== 会话 =====

    /// 从快照恢复 Flow 与测试历史
    pub async fn restore_session(&mut self, snapshot: SessionSnapshot) {
        info!(
            session = %snapshot.session_id,
            entries = snapshot.flow.len(),
            tests = snapshot.test_history.len(),
            "Restoring session"
        );
        self.flow.lock().await.restore(snapshot.flow);
        self.tests.restore(snapshot.test_history);
        if let Some(metadata) = snapshot.metadata {
            self.iterations = metadata.iterations;
            if let Some(metrics) = metadata.token_metrics {
                self.token_metrics = metrics;
            }
        }
        self.session_id = snapshot.session_id;
    }

    /// 恢复最近一次会话；没有会话时返回 false
    pub async fn restore_last_session(&mut self) -> Result<bool, AgentError> {
        match self.context.persistence.last_session().await? {
            Some(snapshot) => {
                self.restore_session(snapshot).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn checkpoint(&self, goal: &str) -> bool {
        let flow = self.flow_entries().await;
        self.context
            .persistence
            .auto_save(
                &self.session_id,
                goal,
                flow,
                self.tests.history(None).to_vec(),
                Some(SessionMetadata {
                    iterations: self.iterations,
                    token_metrics: Some(self.token_metrics),
                }),
            )
            .await
    }

    // ===== 执行循环 =====

    /// 执行目标，返回最后一次模型文本。退出时总会释放进程会话并回到 idle。
    pub async fn execute(&mut self, goal: &str) -> String {
        let outcome = AssertUnwindSafe(self.run_loop(goal)).catch_unwind().await;
        if outcome.is_err() {
            error!(session = %self.session_id, "Agent loop panicked");
        }
        self.release_sessions().await;
        self.set_status(AgentStatus::Idle);
        info!(session = %self.session_id, iterations = self.iterations, "Agent loop finished");
        self.last_text.clone()
    }

    async fn release_sessions(&self) {
        if let Err(e) = self.shell.lock().await.kill().await {
            warn!(error = %e, "Failed to kill interactive process");
        }
        self.lsp.lock().await.stop().await;
    }

    async fn run_loop(&mut self, goal: &str) {
        let agent_config = self.context.config.agent.clone();
        info!(
            goal,
            session = %self.session_id,
            depth = self.depth,
            "Starting agent loop"
        );

        self.last_text.clear();
        let mut iteration: u32 = 0;
        let mut failed_tools: Vec<String> = Vec::new();
        let mut last_checkpoint = 0;

        while iteration < agent_config.max_iterations {
            iteration += 1;
            self.iterations += 1;
            let planning_phase = iteration <= agent_config.planning_iterations;
            self.set_status(AgentStatus::Planning);
            debug!(iteration, planning_phase, "Agent iteration");

            // 1. 检索上下文
            let context = self.retrieve_context(goal).await;

            // 2. 提示词
            let system = self.prompts.system_prompt(&SystemPromptOptions {
                persona: self.persona.as_deref(),
                status: Some(if planning_phase {
                    AgentStatus::Planning
                } else {
                    AgentStatus::Acting
                }),
                include_workflows: iteration == 1,
            });
            let user_prompt = {
                let flow = self.flow.lock().await;
                let mut input = FlowPromptInput::new(goal, &context, flow.entries());
                input.tests = Some(&self.tests);
                input.failed_tools = &failed_tools;
                self.prompts.flow_aware_prompt(&input)
            };

            // 3. 凭证与路由
            let credentials = self.collect_credentials().await;
            let route =
                ModelRoute::select(&agent_config.primary, &agent_config.fallback, &credentials).clone();

            // 4. 生成
            let group = if planning_phase {
                ToolGroup::Planning
            } else {
                ToolGroup::Acting
            };
            let mut messages: Vec<Message> = self.memory.history().iter().map(Message::from).collect();
            messages.push(Message::user(user_prompt.clone()));
            let request = GenerationRequest {
                system,
                messages,
                provider: route.provider.clone(),
                model: route.model.clone(),
                credentials,
                tools: self.router.definitions(group),
            };
            self.token_metrics.input += estimate_request_tokens(&request);

            let response: GenerationResponse = match self.context.generation.generate(request).await {
                Ok(response) => response,
                Err(e) => {
                    // 5. 生成失败终止本目标
                    if e.is_credential_error() {
                        error!(provider = %route.provider, error = %e, retryable = false, "Generation failed");
                    } else {
                        warn!(provider = %route.provider, error = %e, retryable = e.is_retryable(), "Generation failed");
                    }
                    self.memory.add(MemoryRole::System, format!("Error: {e}"));
                    self.memory.record_telemetry(
                        TelemetryEntry::new(TelemetryKind::GenerationFailure, e.to_string()).with_metadata(
                            json!({
                                "provider": route.provider,
                                "model": route.model,
                                "credentialError": e.is_credential_error(),
                                "retryable": e.is_retryable(),
                            }),
                        ),
                    );
                    break;
                }
            };
            self.last_text = response.text.clone();
            self.token_metrics.output += (response.text.chars().count() / 4) as u64;
            self.token_metrics.turns += 1;

            // 6. 执行工具调用
            self.set_status(AgentStatus::Acting);
            failed_tools.clear();
            let mut successes: Vec<Value> = Vec::new();
            for call in &response.tool_calls {
                info!(tool = %call.name, call_id = %call.id, "Executing tool call");
                match self.run_tool_call(&call.id, &call.name, &call.args).await {
                    CallOutcome::Success(output) => {
                        successes.push(json!({ "toolCallId": call.id, "result": output }));
                    }
                    CallOutcome::Failure(message) => {
                        warn!(tool = %call.name, error = %message, "Tool call failed");
                        self.memory.record_telemetry(
                            TelemetryEntry::tool_failure(&call.name, &message).with_metadata(json!({
                                "toolCallId": call.id,
                                "args": call.args,
                                "iteration": iteration,
                            })),
                        );
                        if !failed_tools.contains(&call.name) {
                            failed_tools.push(call.name.clone());
                        }
                    }
                }
            }

            // 7. 观察：成功进入记忆，失败只在 Telemetry
            self.set_status(AgentStatus::Observing);
            self.memory.add(MemoryRole::User, user_prompt);
            self.memory.add(MemoryRole::Assistant, response.text.clone());
            if !successes.is_empty() {
                self.memory.add(
                    MemoryRole::System,
                    format!("Tool Results: {}", Value::Array(successes)),
                );
            }

            // 8. token 高水位
            let estimated = self.memory.estimated_tokens();
            if estimated > agent_config.token_warning_threshold {
                warn!(
                    estimated_tokens = estimated,
                    threshold = agent_config.token_warning_threshold,
                    "Context size above high-water mark"
                );
                self.memory.record_telemetry(
                    TelemetryEntry::new(
                        TelemetryKind::TokenWarning,
                        format!("Estimated context of {estimated} tokens"),
                    )
                    .with_metadata(json!({ "threshold": agent_config.token_warning_threshold })),
                );
            }

            // 9. 检查点
            if agent_config.checkpoint_interval > 0 && iteration % agent_config.checkpoint_interval == 0 {
                self.checkpoint(goal).await;
                last_checkpoint = iteration;
            }

            // 10. 终止条件
            if response.tool_calls.is_empty() && is_completion(&response.text, &agent_config.completion_phrases) {
                info!(iteration, "Goal reported complete");
                break;
            }
        }

        if iteration > 0 && last_checkpoint != iteration {
            self.checkpoint(goal).await;
        }
    }

    async fn retrieve_context(&self, goal: &str) -> String {
        match self.search_workspace(goal).await {
            Ok(results) => results
                .into_iter()
                .map(|r| r.chunk)
                .collect::<Vec<_>>()
                .join(CONTEXT_SEPARATOR),
            Err(e) => {
                warn!(error = %e, "Context retrieval failed");
                String::new()
            }
        }
    }

    async fn collect_credentials(&self) -> HashMap<String, String> {
        let agent = &self.context.config.agent;
        let mut providers: Vec<&str> = agent.providers.iter().map(String::as_str).collect();
        for route in [&agent.primary, &agent.fallback] {
            if !providers.contains(&route.provider.as_str()) {
                providers.push(&route.provider);
            }
        }

        let mut credentials = HashMap::new();
        for provider in providers {
            match self.context.credentials.get_secret(provider).await {
                Ok(Some(secret)) => {
                    credentials.insert(provider.to_string(), secret);
                }
                Ok(None) => debug!(provider, "No credential configured"),
                Err(e) => warn!(provider, error = %e, "Failed to retrieve credential"),
            }
        }
        credentials
    }

    async fn run_tool_call(&mut self, call_id: &str, name: &str, args: &Value) -> CallOutcome {
        let surface = self.router.surface_of(name);
        let affects: Vec<String> = args
            .get("path")
            .and_then(Value::as_str)
            .map(|p| vec![p.to_string()])
            .unwrap_or_default();

        let action = FlowEntry::action(
            surface,
            json!({ "tool": name, "args": args, "callId": call_id }),
        )
        .with_affects(affects);
        let action_id = self.flow.lock().await.append(action);

        let result = self.router.execute_tool(name, args).await;
        let test_command = (name == BuiltinTool::RunCommand.name())
            .then(|| args.get("command").and_then(Value::as_str))
            .flatten()
            .filter(|c| looks_like_test_command(c))
            .map(str::to_string);

        match result {
            Ok(result) => {
                let truncated = self
                    .truncator
                    .truncate_for_context(&result.output, self.memory.estimated_tokens());
                if truncated.truncated {
                    let pruned = truncated.original_chars.saturating_sub(truncated.content.chars().count());
                    self.token_metrics.pruned += (pruned / 4) as u64;
                }

                let observation = FlowEntry::observation(
                    surface,
                    json!({ "tool": name, "output": truncated.content, "truncated": truncated.truncated }),
                )
                .with_caused_by(vec![action_id.clone()])
                .with_affects(result.metadata.affected_paths.clone());
                self.flow.lock().await.append(observation);

                if let Some(command) = test_command {
                    self.record_test_run(&command, Some((result.output.as_str(), result.success)), &action_id)
                        .await;
                }
                CallOutcome::Success(truncated.content)
            }
            Err(e) => {
                let message = e.to_string();
                let observation = FlowEntry::observation(
                    surface,
                    json!({ "tool": name, "success": false, "error": message }),
                )
                .with_caused_by(vec![action_id.clone()]);
                self.flow.lock().await.append(observation);

                if let Some(command) = test_command {
                    self.record_test_run(&command, None, &action_id).await;
                }
                CallOutcome::Failure(message)
            }
        }
    }

    /// 将一次测试命令记入 Test Surface，并追加 test surface 观察
    async fn record_test_run(&mut self, command: &str, outcome: Option<(&str, bool)>, action_id: &str) {
        let related = self.recent_edited_files().await;
        self.tests
            .start_test(command, (!related.is_empty()).then_some(related));

        let update = match outcome {
            Some((output, exited_ok)) => {
                let mut update = TestSurface::parse_test_output(output);
                if !exited_ok && update.failed_tests.unwrap_or(0) == 0 {
                    update.status = Some(TestStatus::Failed);
                }
                update.output = Some(
                    self.truncator
                        .truncate(output, TruncationLevel::Heavy)
                        .content,
                );
                update
            }
            None => TestUpdate {
                status: Some(TestStatus::Failed),
                ..TestUpdate::default()
            },
        };

        let result = match self.tests.complete_test(update) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Failed to record test run");
                return;
            }
        };

        let summary = match result.status {
            TestStatus::Failed => self
                .tests
                .tension_summary()
                .unwrap_or_else(|| format!("Test run failed: {command}")),
            _ => format!("Tests passed ({}/{})", result.passed_tests, result.total_tests),
        };
        let observation = FlowEntry::observation(
            FlowSurface::Test,
            json!({
                "tool": "test_surface",
                "command": command,
                "status": result.status,
                "output": summary,
            }),
        )
        .with_caused_by(vec![action_id.to_string()]);
        self.flow.lock().await.append(observation);
    }

    async fn recent_edited_files(&self) -> Vec<String> {
        let flow = self.flow.lock().await;
        let mut files: Vec<String> = Vec::new();
        for entry in flow
            .entries()
            .iter()
            .rev()
            .filter(|e| e.is_action() && e.surface == FlowSurface::Editor)
            .take(RELATED_EDIT_LOOKBACK)
        {
            for path in entry.affects.iter().flatten() {
                if !files.contains(path) {
                    files.push(path.clone());
                }
            }
        }
        files
    }
}

fn is_completion(text: &str, phrases: &[String]) -> bool {
    let lower = text.to_lowercase();
    phrases.iter().any(|p| lower.contains(&p.to_lowercase()))
}

fn estimate_request_tokens(request: &GenerationRequest) -> u64 {
    let chars = request.system.chars().count()
        + request
            .messages
            .iter()
            .map(|m| m.content.chars().count())
            .sum::<usize>();
    (chars / 4) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_phrases_are_case_insensitive() {
        let phrases = vec!["task complete".to_string(), "finished".to_string()];
        assert!(is_completion("All done. TASK COMPLETE.", &phrases));
        assert!(is_completion("I have Finished the refactor", &phrases));
        assert!(!is_completion("Still working on it", &phrases));
    }
}

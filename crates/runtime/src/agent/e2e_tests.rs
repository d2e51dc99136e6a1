//! Agent 端到端场景：脚本化的生成能力驱动完整循环

use async_trait::async_trait;
use octo_core::{
    AgentStatus, FlowSurface, GenerationCapability, GenerationRequest, GenerationResponse, MemoryRole,
    OctoConfig, ProviderError, StaticCredentials, TelemetryKind, TestStatus, ToolCallRequest,
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use super::{AgentContext, AgentError, CoreAgent};

/// 按顺序返回预置响应；耗尽后回复 "Task complete"
#[derive(Default)]
struct ScriptedGeneration {
    responses: Mutex<VecDeque<Result<GenerationResponse, ProviderError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    /// 预置响应耗尽后 panic 而不是完成
    panic_when_exhausted: bool,
}

impl ScriptedGeneration {
    fn new(responses: Vec<Result<GenerationResponse, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            panic_when_exhausted: false,
        })
    }

    fn panicking(responses: Vec<Result<GenerationResponse, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            panic_when_exhausted: true,
        })
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationCapability for ScriptedGeneration {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(response) => response,
            None if self.panic_when_exhausted => panic!("scripted generation exhausted"),
            None => Ok(GenerationResponse {
                text: "Task complete".into(),
                tool_calls: Vec::new(),
            }),
        }
    }
}

fn reply(text: &str, calls: Vec<(&str, &str, Value)>) -> Result<GenerationResponse, ProviderError> {
    Ok(GenerationResponse {
        text: text.into(),
        tool_calls: calls
            .into_iter()
            .map(|(id, name, args)| ToolCallRequest {
                id: id.into(),
                name: name.into(),
                args,
            })
            .collect(),
    })
}

fn context(dir: &TempDir, generation: Arc<ScriptedGeneration>) -> AgentContext {
    let mut config = OctoConfig::default();
    config.process.settle_ms = 200;
    config.process.lsp_command = Vec::new();
    AgentContext::new(
        dir.path(),
        config,
        generation,
        Arc::new(StaticCredentials::new().with("Anthropic", "sk-test")),
    )
}

fn memory_text(agent: &CoreAgent) -> Vec<(MemoryRole, String)> {
    agent
        .memory()
        .history()
        .into_iter()
        .map(|e| (e.role, e.content))
        .collect()
}

#[tokio::test]
async fn test_write_commit_and_complete() {
    let dir = TempDir::new().unwrap();
    let generation = ScriptedGeneration::new(vec![
        reply(
            "Writing the module",
            vec![(
                "call-1",
                "write_file",
                json!({ "path": "src/lib.rs", "content": "pub fn answer() -> u32 { 42 }\n" }),
            )],
        ),
        reply("Applying", vec![("call-2", "commit_changes", json!({}))]),
        reply("Task complete: module written", vec![]),
    ]);
    let mut agent = CoreAgent::new(context(&dir, generation.clone()), None, 0).unwrap();
    let mut events = agent.subscribe();

    let text = agent.execute("Add an answer function").await;
    assert_eq!(text, "Task complete: module written");
    assert_eq!(agent.status(), AgentStatus::Idle);
    assert_eq!(agent.iterations(), 3);

    let on_disk = std::fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
    assert!(on_disk.contains("answer"));

    let flow = agent.flow_entries().await;
    let write_action = flow
        .iter()
        .find(|e| e.is_action() && e.content["tool"] == "write_file")
        .unwrap();
    assert_eq!(write_action.surface, FlowSurface::Editor);
    assert_eq!(write_action.affects.as_deref(), Some(&["src/lib.rs".to_string()][..]));
    let observation = flow
        .iter()
        .find(|e| e.is_observation() && e.caused_by.as_deref() == Some(&[write_action.id.clone()][..]))
        .unwrap();
    assert!(observation.content["output"].as_str().unwrap().contains("Staged src/lib.rs"));

    let memory = memory_text(&agent);
    assert!(memory.iter().any(|(role, content)| *role == MemoryRole::System
        && content.starts_with("Tool Results: ")
        && content.contains("call-1")));

    // 第一轮只暴露规划工具
    let requests = generation.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].tools.iter().all(|t| t.name != "write_file"));
    assert!(requests[1].tools.iter().any(|t| t.name == "write_file"));
    assert_eq!(requests[0].provider, "Anthropic");

    let mut seen = Vec::new();
    while let Ok(change) = events.try_recv() {
        seen.push(change.to);
    }
    assert_eq!(
        &seen[..4],
        &[
            AgentStatus::Planning,
            AgentStatus::Acting,
            AgentStatus::Observing,
            AgentStatus::Planning
        ]
    );
    assert_eq!(seen.last(), Some(&AgentStatus::Idle));
}

#[tokio::test]
async fn test_generation_failure_ends_goal() {
    let dir = TempDir::new().unwrap();
    let generation = ScriptedGeneration::new(vec![Err(ProviderError::Network {
        message: "connection reset".into(),
    })]);
    let mut agent = CoreAgent::new(context(&dir, generation.clone()), None, 0).unwrap();

    agent.execute("Do anything").await;
    assert_eq!(generation.requests().len(), 1);
    assert_eq!(agent.status(), AgentStatus::Idle);

    let memory = memory_text(&agent);
    assert!(memory
        .iter()
        .any(|(role, content)| *role == MemoryRole::System && content.contains("Error: Network error")));
    assert!(agent
        .memory()
        .telemetry()
        .iter()
        .any(|t| t.kind == TelemetryKind::GenerationFailure));
}

#[tokio::test]
async fn test_tool_failure_goes_to_telemetry_and_tension() {
    let dir = TempDir::new().unwrap();
    let generation = ScriptedGeneration::new(vec![
        reply("Reading", vec![("call-1", "read_file", json!({ "path": "missing.rs" }))]),
        reply("Task complete", vec![]),
    ]);
    let mut agent = CoreAgent::new(context(&dir, generation.clone()), None, 0).unwrap();
    agent.execute("Inspect missing.rs").await;

    let memory = memory_text(&agent);
    assert!(!memory.iter().any(|(_, content)| content.contains("Tool Results")));
    assert!(!memory.iter().any(|(_, content)| content.contains("File not found")));

    let telemetry = agent.memory().telemetry();
    assert_eq!(telemetry.len(), 1);
    assert_eq!(telemetry[0].kind, TelemetryKind::ToolFailure);
    assert_eq!(telemetry[0].tool.as_deref(), Some("read_file"));

    let flow = agent.flow_entries().await;
    assert!(flow.iter().any(|e| e.is_failure()));

    let requests = generation.requests();
    let second_prompt = &requests[1].messages.last().unwrap().content;
    assert!(second_prompt.contains("Tools that failed in the last iteration: read_file"));
}

#[tokio::test]
async fn test_delegation_runs_child_agent() {
    let dir = TempDir::new().unwrap();
    let generation = ScriptedGeneration::new(vec![
        reply(
            "Asking a researcher",
            vec![(
                "call-1",
                "delegate_task",
                json!({ "goal": "Find the config loader", "expertType": "researcher" }),
            )],
        ),
        // 子 Agent 的唯一一轮
        reply("Finished. The loader is in config.rs", vec![]),
        reply("Task complete", vec![]),
    ]);
    let mut agent = CoreAgent::new(context(&dir, generation.clone()), None, 0).unwrap();
    agent.execute("Where is config loaded?").await;

    let requests = generation.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[1].system.to_lowercase().contains("researcher"));

    let memory = memory_text(&agent);
    assert!(memory.iter().any(|(_, content)| content.contains("EXPERT (RESEARCHER) REPORT:")
        && content.contains("The loader is in config.rs")));
}

#[tokio::test]
async fn test_depth_ceiling_and_checkpoint() {
    let dir = TempDir::new().unwrap();
    let generation = ScriptedGeneration::new(vec![reply("Task complete", vec![])]);
    let ctx = context(&dir, generation);

    let too_deep = CoreAgent::new(ctx.clone(), Some("coder".into()), 3);
    assert!(matches!(
        too_deep,
        Err(AgentError::DelegationDepthExceeded { depth: 3, max: 3 })
    ));

    let mut agent = CoreAgent::new(ctx.clone(), None, 0).unwrap();
    agent.intervene("Prefer small commits").await;
    agent.execute("Tidy up").await;

    let snapshot = ctx.persistence.last_session().await.unwrap().unwrap();
    assert_eq!(snapshot.session_id, agent.session_id());
    assert_eq!(snapshot.goal, "Tidy up");
    assert!(snapshot.flow.iter().any(|e| e.is_human_intervention()));
    assert_eq!(snapshot.metadata.unwrap().iterations, 1);

    let mut restored = CoreAgent::new(ctx, None, 0).unwrap();
    assert!(restored.restore_last_session().await.unwrap());
    assert_eq!(restored.session_id(), agent.session_id());
    assert_eq!(restored.flow_entries().await.len(), snapshot.flow.len());
}

#[tokio::test]
async fn test_test_command_feeds_test_surface() {
    let dir = TempDir::new().unwrap();
    let failing = "pytest() { printf 'test parse_ok ... FAILED\\ntest result: FAILED. 1 passed; 1 failed; 0 ignored\\n'; return 1; }; pytest";
    let generation = ScriptedGeneration::new(vec![
        reply("Running tests", vec![("call-1", "run_command", json!({ "command": failing }))]),
        reply("Task complete", vec![]),
    ]);
    let mut agent = CoreAgent::new(context(&dir, generation.clone()), None, 0).unwrap();
    agent.execute("Run the tests").await;

    let last = agent.tests().last_test().unwrap();
    assert_eq!(last.status, TestStatus::Failed);
    assert_eq!(last.failed_tests, 1);
    assert_eq!(last.failed_test_names.as_deref(), Some(&["parse_ok".to_string()][..]));

    let flow = agent.flow_entries().await;
    let test_observation = flow.iter().find(|e| e.surface == FlowSurface::Test).unwrap();
    assert_eq!(test_observation.content["status"], "failed");

    let requests = generation.requests();
    let second_prompt = &requests[1].messages.last().unwrap().content;
    assert!(second_prompt.contains("1 test(s) failing: parse_ok"));
}

#[tokio::test]
async fn test_index_and_search_workspace() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("src/parser.rs"),
        "pub fn parse_expression(tokens: &[Token]) -> Expr { todo!() }\n",
    )
    .unwrap();
    let generation = ScriptedGeneration::new(vec![]);
    let mut agent = CoreAgent::new(context(&dir, generation), None, 0).unwrap();

    let report = agent.initialize_workspace().await.unwrap();
    assert_eq!(report.changed_files, 1);
    assert!(report.total_chunks >= 1);
    assert_eq!(agent.status(), AgentStatus::Idle);

    let results = agent.search_workspace("parse expression").await.unwrap();
    assert_eq!(results[0].path, "src/parser.rs");

    // 未变化的工作区不重新切分
    let again = agent.initialize_workspace().await.unwrap();
    assert_eq!(again.changed_files, 0);
    assert_eq!(again.total_chunks, report.total_chunks);
}

#[tokio::test]
async fn test_index_recovers_from_corrupt_snapshot() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("src/lexer.rs"),
        "pub fn next_token(source: &str) -> Option<Token> { None }\n",
    )
    .unwrap();
    let ctx = context(&dir, ScriptedGeneration::new(vec![]));
    let mut agent = CoreAgent::new(ctx.clone(), None, 0).unwrap();

    let first = agent.initialize_workspace().await.unwrap();
    assert!(first.total_chunks >= 1);

    let snapshot_path = ctx.state_dir().join(octo_cognition::VECTOR_STORE_FILE);
    let mut snapshot: Value = serde_json::from_slice(&std::fs::read(&snapshot_path).unwrap()).unwrap();
    snapshot["checksum"] = json!("0000");
    std::fs::write(&snapshot_path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

    let second = agent.initialize_workspace().await.unwrap();
    assert_eq!(second.changed_files, 1);
    assert_eq!(second.total_chunks, first.total_chunks);

    let results = agent.search_workspace("next token").await.unwrap();
    assert_eq!(results[0].path, "src/lexer.rs");

    std::fs::write(&snapshot_path, "{ not json").unwrap();
    let third = agent.initialize_workspace().await.unwrap();
    assert_eq!(third.changed_files, 1);
    assert_eq!(third.total_chunks, first.total_chunks);
}

fn process_gone(pid: &str) -> bool {
    !std::path::Path::new("/proc").join(pid).exists()
}

#[tokio::test]
async fn test_execute_releases_terminal_on_finish() {
    let dir = TempDir::new().unwrap();
    let generation = ScriptedGeneration::new(vec![
        reply(
            "Starting server",
            vec![(
                "call-1",
                "spawn_command",
                json!({ "command": "echo $$ > server.pid; exec sleep 30" }),
            )],
        ),
        reply("Task complete", vec![]),
    ]);
    let mut agent = CoreAgent::new(context(&dir, generation), None, 0).unwrap();
    agent.execute("Start the dev server").await;

    let pid = std::fs::read_to_string(dir.path().join("server.pid")).unwrap();
    assert!(process_gone(pid.trim()));
    assert!(!agent.shell().lock().await.is_alive());
    assert!(!agent.lsp().lock().await.is_running());
    assert_eq!(agent.status(), AgentStatus::Idle);
}

#[tokio::test]
async fn test_execute_releases_terminal_after_panic() {
    let dir = TempDir::new().unwrap();
    let generation = ScriptedGeneration::panicking(vec![reply(
        "Starting server",
        vec![(
            "call-1",
            "spawn_command",
            json!({ "command": "echo $$ > server.pid; exec sleep 30" }),
        )],
    )]);
    let mut agent = CoreAgent::new(context(&dir, generation.clone()), None, 0).unwrap();
    let text = agent.execute("Start the dev server").await;

    assert_eq!(generation.requests().len(), 2);
    assert_eq!(text, "Starting server");
    let pid = std::fs::read_to_string(dir.path().join("server.pid")).unwrap();
    assert!(process_gone(pid.trim()));
    assert!(!agent.shell().lock().await.is_alive());
    assert_eq!(agent.status(), AgentStatus::Idle);
}

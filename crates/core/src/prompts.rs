//! Prompt Factory - 提示词构建
//!
//! 职责：
//! - 系统提示词：身份、persona、当前模式、(首轮) 工作流提示
//! - Flow 感知的用户提示词：Engineering Tension 置顶，随后是目标、
//!   裁剪后的工程叙事和检索上下文
//!
//! 叙事裁剪规则：
//! - human_intervention 与 action 原样保留
//! - 过长的 observation 截断并标记 `(Truncated)`
//! - 失败的 observation 只保留工具名，不回显错误内容

use crate::flow::{FlowEntry, FlowEntryType, FlowSurface};
use crate::status::AgentStatus;
use crate::test_surface::TestSurface;

/// 叙事窗口保留的最近条目数 (人工干预始终保留)
const NARRATIVE_WINDOW: usize = 30;

/// 检测测试失败时回看的条目数
const TENSION_LOOKBACK: usize = 10;

pub const TENSION_HEADER: &str = "CURRENT ENGINEERING TENSION";

const WORKFLOWS: &str = "
IMPORTANT WORKFLOW - CODE INTELLIGENCE (LSP):
1. Use 'go_to_definition', 'find_references', 'list_symbols', and 'get_hover' to explore code.
2. LSP tools use 0-indexed line and character positions.

IMPORTANT WORKFLOW - SHADOW FILESYSTEM:
1. 'write_file' stages changes in a shadow filesystem; nothing touches the real file yet.
2. Verify staged changes with 'read_file', then call 'commit_changes' to apply or 'discard_changes' to revert.

IMPORTANT WORKFLOW - INTERACTIVE TERMINAL:
1. Use 'run_command' for quick one-shot tasks.
2. Use 'spawn_command' for long-running or interactive processes.
3. Call 'read_terminal' periodically and 'send_terminal_input' when the process expects input.

IMPORTANT WORKFLOW - DELEGATION:
1. Use 'delegate_task' to hand a focused sub-goal to a researcher, reviewer, or coder expert.
";

/// 系统提示词选项
#[derive(Debug, Clone, Default)]
pub struct SystemPromptOptions<'a> {
    pub persona: Option<&'a str>,
    pub status: Option<AgentStatus>,
    pub include_workflows: bool,
}

/// Flow 感知用户提示词的输入
#[derive(Debug, Clone, Copy)]
pub struct FlowPromptInput<'a> {
    pub goal: &'a str,
    pub context: &'a str,
    pub flow: &'a [FlowEntry],
    pub tests: Option<&'a TestSurface>,
    /// 上一轮失败的工具名 (只有名字，没有错误内容)
    pub failed_tools: &'a [String],
}

impl<'a> FlowPromptInput<'a> {
    pub fn new(goal: &'a str, context: &'a str, flow: &'a [FlowEntry]) -> Self {
        Self {
            goal,
            context,
            flow,
            tests: None,
            failed_tools: &[],
        }
    }
}

/// Prompt Factory
#[derive(Debug, Clone)]
pub struct PromptFactory {
    observation_limit: usize,
}

impl Default for PromptFactory {
    fn default() -> Self {
        Self {
            observation_limit: 500,
        }
    }
}

impl PromptFactory {
    pub fn new(observation_limit: usize) -> Self {
        Self { observation_limit }
    }

    pub fn system_prompt(&self, options: &SystemPromptOptions<'_>) -> String {
        let mut prompt = String::from("You are OctoTask, an intelligent AI coding agent.");

        if let Some(persona) = options.persona.filter(|p| !p.trim().is_empty()) {
            prompt.push_str(&format!("\n[ROLE: {}]", persona.to_uppercase()));
        }
        if let Some(status) = options.status {
            prompt.push_str(&format!("\nCURRENT MODE: {}", status.as_str().to_uppercase()));
        }

        prompt.push_str(
            "\nYour goal is to help the user with their coding tasks by planning, acting, and reflecting.\n",
        );
        if options.include_workflows {
            prompt.push_str(WORKFLOWS);
        }
        prompt.push_str(
            "\nWhen the goal is achieved, reply without tool calls and state \"Task complete\".\n",
        );
        prompt
    }

    /// Flow 感知用户提示词
    pub fn flow_aware_prompt(&self, input: &FlowPromptInput<'_>) -> String {
        let mut prompt = String::new();

        let tensions = self.tensions(input);
        if !tensions.is_empty() {
            prompt.push_str(TENSION_HEADER);
            prompt.push_str(":\n");
            for tension in &tensions {
                prompt.push_str(&format!("- {tension}\n"));
            }
            prompt.push('\n');
        }

        prompt.push_str(&format!("GOAL: {}\n\n", input.goal));

        let narrative = self.narrative(input.flow);
        if !narrative.is_empty() {
            prompt.push_str("RECENT FLOW:\n");
            for line in narrative {
                prompt.push_str(&line);
                prompt.push('\n');
            }
            prompt.push('\n');
        }

        if !input.context.is_empty() {
            prompt.push_str(&format!("CONTEXT:\n{}\n\n", input.context));
        }

        prompt
    }

    fn tensions(&self, input: &FlowPromptInput<'_>) -> Vec<String> {
        let mut tensions = Vec::new();

        if let Some(tests) = input.tests {
            if let Some(summary) = tests.tension_summary() {
                tensions.push(format!("Failing tests: {summary}"));
            }
            let mut files: Vec<String> = Vec::new();
            for analysis in tests.analyze_failures(input.flow) {
                for file in analysis.affected_files {
                    if !files.contains(&file) {
                        files.push(file);
                    }
                }
            }
            if !files.is_empty() {
                tensions.push(format!("Files implicated by recent edits: {}", files.join(", ")));
            }
        }

        let start = input.flow.len().saturating_sub(TENSION_LOOKBACK);
        let tests_failing = input.flow[start..].iter().any(|e| {
            e.is_observation()
                && e.surface == FlowSurface::Test
                && e.content_text().to_lowercase().contains("fail")
        });
        if tests_failing {
            tensions.push("Tests failing after recent changes".to_string());
        }

        if let Some(correction) = input.flow.iter().rev().find(|e| e.is_human_intervention()) {
            tensions.push(format!(
                "User corrected approach mid-task: {}",
                correction.content_text()
            ));
        }

        if !input.failed_tools.is_empty() {
            tensions.push(format!(
                "Tools that failed in the last iteration: {}",
                input.failed_tools.join(", ")
            ));
        }

        tensions
    }

    fn narrative(&self, flow: &[FlowEntry]) -> Vec<String> {
        let window_start = flow.len().saturating_sub(NARRATIVE_WINDOW);
        flow.iter()
            .enumerate()
            .filter(|(i, e)| *i >= window_start || e.is_human_intervention())
            .map(|(_, e)| self.render_entry(e))
            .collect()
    }

    fn render_entry(&self, entry: &FlowEntry) -> String {
        let surface = entry.surface.as_str();
        match entry.entry_type {
            FlowEntryType::HumanIntervention => {
                format!("[HUMAN INTERVENTION] {}", entry.content_text())
            }
            FlowEntryType::Action => format!("[ACTION/{surface}] {}", entry.content_text()),
            FlowEntryType::Observation if entry.is_failure() => {
                let tool = entry
                    .content
                    .get("tool")
                    .and_then(|t| t.as_str())
                    .unwrap_or("operation");
                format!("[OBSERVATION/{surface}] {tool} failed")
            }
            FlowEntryType::Observation => {
                let text = observation_text(entry);
                format!("[OBSERVATION/{surface}] {}", self.prune(&text))
            }
        }
    }

    fn prune(&self, text: &str) -> String {
        if text.chars().count() <= self.observation_limit {
            return text.to_string();
        }
        let head: String = text.chars().take(self.observation_limit).collect();
        format!("{head}... (Truncated)")
    }
}

/// 观察内容优先取 `output` 字段
fn observation_text(entry: &FlowEntry) -> String {
    match entry.content.get("output").and_then(|o| o.as_str()) {
        Some(output) => {
            let tool = entry.content.get("tool").and_then(|t| t.as_str());
            match tool {
                Some(tool) => format!("{tool}: {output}"),
                None => output.to_string(),
            }
        }
        None => entry.content_text(),
    }
}

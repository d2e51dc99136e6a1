//! Test Surface - 测试执行跟踪
//!
//! 职责：
//! - 跟踪测试运行 (running → passed / failed)
//! - 解析 Vitest / cargo test 输出
//! - 将失败与最近的编辑动作关联
//! - 为 Engineering Tension 生成摘要
//!
//! 一次运行在 `complete_test` 之前可变，完成后不可变并写入历史。

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::flow::{FlowEntry, FlowSurface};

/// 关联分析时回看的编辑动作数量
const CORRELATION_WINDOW: usize = 10;

/// Tension 摘要中列出的失败用例数量
const SUMMARY_NAME_LIMIT: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TestSurfaceError {
    #[error("No active test to {0}")]
    NoActiveTest(&'static str),
}

/// 测试运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Running,
    Passed,
    Failed,
}

/// 一次测试运行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub status: TestStatus,
    pub total_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_test_names: Option<Vec<String>>,
    /// 秒
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_files: Option<Vec<String>>,
}

/// 对运行中测试的部分更新
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestUpdate {
    pub status: Option<TestStatus>,
    pub total_tests: Option<u32>,
    pub passed_tests: Option<u32>,
    pub failed_tests: Option<u32>,
    pub failed_test_names: Option<Vec<String>>,
    pub duration: Option<f64>,
    pub output: Option<String>,
}

impl TestUpdate {
    fn apply(self, target: &mut TestResult) {
        if let Some(status) = self.status {
            target.status = status;
        }
        if let Some(total) = self.total_tests {
            target.total_tests = total;
        }
        if let Some(passed) = self.passed_tests {
            target.passed_tests = passed;
        }
        if let Some(failed) = self.failed_tests {
            target.failed_tests = failed;
        }
        if self.failed_test_names.is_some() {
            target.failed_test_names = self.failed_test_names;
        }
        if self.duration.is_some() {
            target.duration = self.duration;
        }
        if self.output.is_some() {
            target.output = self.output;
        }
    }
}

/// 失败关联分析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFailureAnalysis {
    pub test_name: String,
    /// 可能导致失败的 Flow 动作 id
    pub possible_causes: Vec<String>,
    pub affected_files: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct TestSurface {
    history: Vec<TestResult>,
    current: Option<TestResult>,
}

impl TestSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始一次运行；若已有运行中的测试则放弃它
    pub fn start_test(&mut self, command: impl Into<String>, related_files: Option<Vec<String>>) -> &TestResult {
        if let Some(abandoned) = self.current.take() {
            warn!(id = %abandoned.id, command = %abandoned.command, "Abandoning unfinished test run");
        }

        let result = TestResult {
            id: ulid::Ulid::new().to_string(),
            timestamp: Utc::now(),
            command: command.into(),
            status: TestStatus::Running,
            total_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            failed_test_names: None,
            duration: None,
            output: None,
            related_files,
        };
        debug!(id = %result.id, command = %result.command, "Test run started");
        self.current.insert(result)
    }

    pub fn update_test(&mut self, update: TestUpdate) -> Result<(), TestSurfaceError> {
        let current = self
            .current
            .as_mut()
            .ok_or(TestSurfaceError::NoActiveTest("update"))?;
        update.apply(current);
        Ok(())
    }

    /// 完成当前运行；状态仍为 running 时按失败数判定
    pub fn complete_test(&mut self, update: TestUpdate) -> Result<TestResult, TestSurfaceError> {
        let mut current = self
            .current
            .take()
            .ok_or(TestSurfaceError::NoActiveTest("complete"))?;
        update.apply(&mut current);

        if current.status == TestStatus::Running {
            current.status = if current.failed_tests > 0 {
                TestStatus::Failed
            } else {
                TestStatus::Passed
            };
        }

        debug!(
            id = %current.id,
            status = ?current.status,
            passed = current.passed_tests,
            failed = current.failed_tests,
            "Test run completed"
        );
        self.history.push(current.clone());
        Ok(current)
    }

    /// 从测试输出中提取结构化结果 (Vitest 与 cargo test)
    pub fn parse_test_output(output: &str) -> TestUpdate {
        let mut update = TestUpdate {
            output: Some(output.to_string()),
            ..TestUpdate::default()
        };

        let mut passed: Option<u32> = None;
        let mut failed: Option<u32> = None;
        let mut duration: Option<f64> = None;

        // Vitest: " Tests  1 failed | 4 passed (5)"
        if let Some(line) = vitest_line_re().captures(output).and_then(|c| c.get(1)) {
            passed = capture_u32(vitest_passed_re(), line.as_str());
            failed = capture_u32(vitest_failed_re(), line.as_str());
        }

        // cargo: "test result: FAILED. 3 passed; 1 failed; 0 ignored; ...; finished in 0.52s"
        for caps in cargo_result_re().captures_iter(output) {
            let p = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()).unwrap_or(0);
            let f = caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok()).unwrap_or(0);
            passed = Some(passed.unwrap_or(0) + p);
            failed = Some(failed.unwrap_or(0) + f);
            let secs = cargo_finished_re()
                .captures(caps.get(3).map_or("", |m| m.as_str()))
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok());
            if let Some(secs) = secs {
                duration = Some(duration.unwrap_or(0.0) + secs);
            }
        }

        if duration.is_none() {
            duration = vitest_duration_re()
                .captures(output)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok());
        }

        if passed.is_some() || failed.is_some() {
            update.passed_tests = passed;
            update.failed_tests = failed;
            update.total_tests = Some(passed.unwrap_or(0) + failed.unwrap_or(0));
        }
        update.duration = duration;

        let names = failed_test_names(output);
        if !names.is_empty() {
            update.failed_test_names = Some(names);
        }

        update
    }

    /// 将最近一次失败的运行与最近的编辑动作关联
    pub fn analyze_failures(&self, flow: &[FlowEntry]) -> Vec<TestFailureAnalysis> {
        let Some(last) = self.last_test() else {
            return Vec::new();
        };
        if last.status != TestStatus::Failed {
            return Vec::new();
        }
        let Some(names) = last.failed_test_names.as_ref() else {
            return Vec::new();
        };

        let edits: Vec<&FlowEntry> = flow
            .iter()
            .filter(|e| e.is_action() && e.surface == FlowSurface::Editor)
            .collect();
        let recent = &edits[edits.len().saturating_sub(CORRELATION_WINDOW)..];

        let mut affected_files: Vec<String> = Vec::new();
        for change in recent {
            let mut paths: Vec<String> = change.affects.clone().unwrap_or_default();
            if let Some(path) = change
                .content
                .get("args")
                .and_then(|a| a.get("path"))
                .and_then(|p| p.as_str())
            {
                paths.push(path.to_string());
            }
            for path in paths {
                if !affected_files.contains(&path) {
                    affected_files.push(path);
                }
            }
        }
        let possible_causes: Vec<String> = recent.iter().map(|e| e.id.clone()).collect();

        names
            .iter()
            .map(|name| TestFailureAnalysis {
                test_name: name.clone(),
                possible_causes: possible_causes.clone(),
                affected_files: affected_files.clone(),
            })
            .collect()
    }

    /// 最近一次完成的运行
    pub fn last_test(&self) -> Option<&TestResult> {
        self.history.last()
    }

    /// 历史记录；`limit` 为 Some 时返回最近的 limit 条
    pub fn history(&self, limit: Option<usize>) -> &[TestResult] {
        match limit {
            Some(n) => &self.history[self.history.len().saturating_sub(n)..],
            None => &self.history,
        }
    }

    pub fn current_test(&self) -> Option<&TestResult> {
        self.current.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    /// 例如 "2 test(s) failing: a, b"；最近一次运行未失败时为 None
    pub fn tension_summary(&self) -> Option<String> {
        let last = self.last_test()?;
        if last.status != TestStatus::Failed {
            return None;
        }

        let names = last.failed_test_names.as_deref().unwrap_or_default();
        let listed = if names.is_empty() {
            "unknown tests".to_string()
        } else {
            names
                .iter()
                .take(SUMMARY_NAME_LIMIT)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        };
        let ellipsis = if names.len() > SUMMARY_NAME_LIMIT { "..." } else { "" };

        Some(format!("{} test(s) failing: {}{}", last.failed_tests, listed, ellipsis))
    }

    /// 用持久化的历史替换当前内容
    pub fn restore(&mut self, history: Vec<TestResult>) {
        self.history = history;
        self.current = None;
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.current = None;
    }
}

/// 判断命令是否为测试运行
pub fn looks_like_test_command(command: &str) -> bool {
    let command = command.trim();
    [
        "cargo test",
        "cargo nextest",
        "npm test",
        "npm run test",
        "pnpm test",
        "pnpm run test",
        "yarn test",
        "npx vitest",
        "vitest",
        "pytest",
        "go test",
    ]
    .iter()
    .any(|prefix| command.starts_with(prefix))
}

fn vitest_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*Tests\s+(.+)$").expect("valid vitest summary regex"))
}

fn vitest_passed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s+passed").expect("valid passed count regex"))
}

fn vitest_failed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s+failed").expect("valid failed count regex"))
}

fn vitest_duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Duration\s+([\d.]+)s").expect("valid duration regex"))
}

fn cargo_result_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^test result: \w+\. (\d+) passed; (\d+) failed;(.*)$")
            .expect("valid cargo result regex")
    })
}

fn cargo_finished_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"finished in ([\d.]+)s").expect("valid cargo duration regex"))
}

/// ❌ 标记 / Vitest FAIL 行 / cargo `... FAILED` 行
fn failed_name_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"(?m)^\s*❌\s+(.+?)\s*$",
            r"(?m)^\s*FAIL\s+(.+?)\s*$",
            r"(?m)^test (\S+) \.\.\. FAILED\s*$",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid failed test name regex"))
        .collect()
    })
}

fn capture_u32(re: &Regex, haystack: &str) -> Option<u32> {
    re.captures(haystack)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
}

fn failed_test_names(output: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for re in failed_name_res() {
        for caps in re.captures_iter(output) {
            if let Some(m) = caps.get(1) {
                let name = m.as_str().trim().to_string();
                if !name.is_empty() && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lifecycle_sets_status_from_failures() {
        let mut surface = TestSurface::new();
        surface.start_test("npm test", Some(vec!["src/a.ts".into()]));
        assert!(surface.is_running());
        assert!(surface.last_test().is_none());

        surface
            .update_test(TestUpdate {
                passed_tests: Some(3),
                ..TestUpdate::default()
            })
            .unwrap();
        let done = surface
            .complete_test(TestUpdate {
                failed_tests: Some(1),
                ..TestUpdate::default()
            })
            .unwrap();

        assert_eq!(done.status, TestStatus::Failed);
        assert_eq!(done.passed_tests, 3);
        assert!(!surface.is_running());
        assert_eq!(surface.history(None).len(), 1);
    }

    #[test]
    fn test_complete_without_failures_passes() {
        let mut surface = TestSurface::new();
        surface.start_test("cargo test", None);
        let done = surface.complete_test(TestUpdate::default()).unwrap();
        assert_eq!(done.status, TestStatus::Passed);
    }

    #[test]
    fn test_update_without_active_run_errors() {
        let mut surface = TestSurface::new();
        assert_eq!(
            surface.update_test(TestUpdate::default()),
            Err(TestSurfaceError::NoActiveTest("update"))
        );
        assert!(surface.complete_test(TestUpdate::default()).is_err());
    }

    #[test]
    fn test_parse_vitest_output() {
        let output = " ❌ adds numbers\n ❌ handles zero\n\n Test Files  1 failed (1)\n      Tests  2 failed | 5 passed (7)\n   Duration  1.25s\n";
        let update = TestSurface::parse_test_output(output);
        assert_eq!(update.passed_tests, Some(5));
        assert_eq!(update.failed_tests, Some(2));
        assert_eq!(update.total_tests, Some(7));
        assert_eq!(update.duration, Some(1.25));
        assert_eq!(
            update.failed_test_names,
            Some(vec!["adds numbers".to_string(), "handles zero".to_string()])
        );
    }

    #[test]
    fn test_output_patterns_compiled_once() {
        assert!(std::ptr::eq(cargo_result_re(), cargo_result_re()));
        assert!(std::ptr::eq(failed_name_res(), failed_name_res()));
        assert_eq!(failed_name_res().len(), 3);

        let output = "test a ... FAILED\ntest result: FAILED. 2 passed; 1 failed; 0 ignored; finished in 0.25s\n";
        for _ in 0..3 {
            let update = TestSurface::parse_test_output(output);
            assert_eq!(update.failed_tests, Some(1));
            assert_eq!(update.duration, Some(0.25));
            assert_eq!(update.failed_test_names, Some(vec!["a".to_string()]));
        }
    }

    #[test]
    fn test_parse_cargo_output() {
        let output = "running 3 tests\ntest a::ok ... ok\ntest a::bad ... FAILED\n\ntest result: FAILED. 2 passed; 1 failed; 0 ignored; 0 measured; 0 filtered out; finished in 0.50s\n";
        let update = TestSurface::parse_test_output(output);
        assert_eq!(update.passed_tests, Some(2));
        assert_eq!(update.failed_tests, Some(1));
        assert_eq!(update.total_tests, Some(3));
        assert_eq!(update.duration, Some(0.5));
        assert_eq!(update.failed_test_names, Some(vec!["a::bad".to_string()]));
    }

    #[test]
    fn test_tension_summary_lists_three_names() {
        let mut surface = TestSurface::new();
        assert!(surface.tension_summary().is_none());

        surface.start_test("npm test", None);
        surface
            .complete_test(TestUpdate {
                failed_tests: Some(4),
                failed_test_names: Some(vec!["a".into(), "b".into(), "c".into(), "d".into()]),
                ..TestUpdate::default()
            })
            .unwrap();

        assert_eq!(
            surface.tension_summary().as_deref(),
            Some("4 test(s) failing: a, b, c...")
        );
    }

    #[test]
    fn test_analyze_failures_correlates_editor_actions() {
        let mut surface = TestSurface::new();
        surface.start_test("npm test", None);
        surface
            .complete_test(TestUpdate {
                failed_tests: Some(1),
                failed_test_names: Some(vec!["adds".into()]),
                ..TestUpdate::default()
            })
            .unwrap();

        let edit = FlowEntry::action(
            FlowSurface::Editor,
            json!({"tool": "write_file", "args": {"path": "src/math.ts"}}),
        )
        .with_affects(vec!["src/math.ts".into(), "src/index.ts".into()]);
        let shell = FlowEntry::action(FlowSurface::Terminal, json!({"tool": "run_command"}));
        let edit_id = edit.id.clone();

        let analyses = surface.analyze_failures(&[edit, shell]);
        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].test_name, "adds");
        assert_eq!(analyses[0].possible_causes, vec![edit_id]);
        assert_eq!(analyses[0].affected_files, vec!["src/math.ts", "src/index.ts"]);
    }

    #[test]
    fn test_looks_like_test_command() {
        assert!(looks_like_test_command("cargo test -p octo-core"));
        assert!(looks_like_test_command("  npm test"));
        assert!(!looks_like_test_command("ls -la"));
    }
}

//! Generation - 外部生成能力与凭证来源的边界
//!
//! 职责：
//! - `GenerationCapability`: 调用外部语言模型 (本系统不做推理)
//! - `CredentialSource`: 按 provider 查询密钥
//! - 模型路由：主路由缺少凭证时回退
//!
//! 错误分为凭证类 (不可重试) 与其他 (可重试)。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::memory::{MemoryEntry, MemoryRole};

/// Provider 错误
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Missing credential for provider: {provider}")]
    MissingCredential { provider: String },

    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("API error: {message}")]
    Api {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Network error: {message}")]
    Network { message: String },
}

impl ProviderError {
    /// 凭证类错误
    pub fn is_credential_error(&self) -> bool {
        matches!(
            self,
            ProviderError::MissingCredential { .. } | ProviderError::Auth { .. }
        )
    }

    /// 其余错误视为可重试
    pub fn is_retryable(&self) -> bool {
        !self.is_credential_error()
    }
}

/// 模型消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MemoryRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MemoryRole::User,
            content: content.into(),
        }
    }
}

impl From<&MemoryEntry> for Message {
    fn from(entry: &MemoryEntry) -> Self {
        Self {
            role: entry.role,
            content: entry.content.clone(),
        }
    }
}

/// 提供给模型的工具定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// 生成请求
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub provider: String,
    pub model: String,
    pub credentials: HashMap<String, String>,
    pub tools: Vec<ToolDefinition>,
}

/// 生成结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
}

/// 外部生成能力
#[async_trait]
pub trait GenerationCapability: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, ProviderError>;
}

/// 凭证来源错误
#[derive(Debug, Error)]
#[error("Credential lookup failed for {provider}: {message}")]
pub struct CredentialError {
    pub provider: String,
    pub message: String,
}

/// 凭证来源
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn get_secret(&self, provider: &str) -> Result<Option<String>, CredentialError>;
}

/// 内存中的静态凭证
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    secrets: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secrets.insert(provider.into(), secret.into());
        self
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn get_secret(&self, provider: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.secrets.get(provider).cloned())
    }
}

/// 从环境变量 `<PROVIDER>_API_KEY` 读取凭证
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    pub fn variable_for(provider: &str) -> String {
        let normalized: String = provider
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{normalized}_API_KEY")
    }
}

#[async_trait]
impl CredentialSource for EnvCredentials {
    async fn get_secret(&self, provider: &str) -> Result<Option<String>, CredentialError> {
        match std::env::var(Self::variable_for(provider)) {
            Ok(value) if !value.trim().is_empty() => Ok(Some(value)),
            Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(CredentialError {
                provider: provider.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// provider + model 路由
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRoute {
    pub provider: String,
    pub model: String,
}

impl ModelRoute {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// 主路由有凭证时选主路由，否则回退
    pub fn select<'a>(
        primary: &'a ModelRoute,
        fallback: &'a ModelRoute,
        credentials: &HashMap<String, String>,
    ) -> &'a ModelRoute {
        if credentials.contains_key(&primary.provider) {
            primary
        } else {
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::Auth { message: "bad key".into() }.is_credential_error());
        assert!(!ProviderError::MissingCredential { provider: "OpenAI".into() }.is_retryable());
        assert!(ProviderError::Network { message: "reset".into() }.is_retryable());
    }

    #[test]
    fn test_route_selection_falls_back_without_primary_credential() {
        let primary = ModelRoute::new("Anthropic", "claude-3-5-sonnet-20240620");
        let fallback = ModelRoute::new("OpenAI", "gpt-4o");

        let mut creds = HashMap::new();
        creds.insert("OpenAI".to_string(), "sk".to_string());
        assert_eq!(ModelRoute::select(&primary, &fallback, &creds), &fallback);

        creds.insert("Anthropic".to_string(), "ak".to_string());
        assert_eq!(ModelRoute::select(&primary, &fallback, &creds), &primary);
    }

    #[tokio::test]
    async fn test_static_credentials() {
        let creds = StaticCredentials::new().with("OpenAI", "sk-test");
        assert_eq!(creds.get_secret("OpenAI").await.unwrap().as_deref(), Some("sk-test"));
        assert!(creds.get_secret("Anthropic").await.unwrap().is_none());
    }

    #[test]
    fn test_env_variable_name() {
        assert_eq!(EnvCredentials::variable_for("OpenAI"), "OPENAI_API_KEY");
        assert_eq!(EnvCredentials::variable_for("google-ai"), "GOOGLE_AI_API_KEY");
    }
}

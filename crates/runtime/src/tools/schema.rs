//! Tool Schema - JSON Schema 定义用于模型参数理解
//!
//! - 每个工具都有清晰的 JSON Schema
//! - Schema 随工具定义一起发给生成能力
//! - 参数结构体的 serde 反序列化是最终校验

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// JSON Schema 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonSchemaType {
    String,
    Integer,
    Boolean,
    Object,
}

/// JSON Schema 属性
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSchemaProperty {
    #[serde(rename = "type")]
    pub type_: JsonSchemaType,

    /// 描述（模型理解的关键）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_: Option<Vec<serde_json::Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
}

impl JsonSchemaProperty {
    fn typed(type_: JsonSchemaType, desc: impl Into<String>) -> Self {
        Self {
            type_,
            description: Some(desc.into()),
            enum_: None,
            minimum: None,
        }
    }

    pub fn string(desc: impl Into<String>) -> Self {
        Self::typed(JsonSchemaType::String, desc)
    }

    pub fn integer(desc: impl Into<String>) -> Self {
        Self::typed(JsonSchemaType::Integer, desc)
    }

    pub fn boolean(desc: impl Into<String>) -> Self {
        Self::typed(JsonSchemaType::Boolean, desc)
    }

    /// 设置枚举值
    pub fn enum_values(mut self, values: &[&str]) -> Self {
        self.enum_ = Some(values.iter().map(|v| serde_json::json!(v)).collect());
        self
    }

    pub fn minimum(mut self, min: f64) -> Self {
        self.minimum = Some(min);
        self
    }
}

/// 对象 Schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSchema {
    #[serde(rename = "type")]
    pub type_: JsonSchemaType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub properties: BTreeMap<String, JsonSchemaProperty>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl Default for JsonSchema {
    fn default() -> Self {
        Self {
            type_: JsonSchemaType::Object,
            description: None,
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl JsonSchema {
    /// 转换为 JSON Schema Value
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
    }
}

/// Schema 构建器
#[derive(Debug, Default)]
pub struct ToolSchemaBuilder {
    schema: JsonSchema,
}

impl ToolSchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.schema.description = Some(desc.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, prop: JsonSchemaProperty, required: bool) -> Self {
        let name = name.into();
        if required && !self.schema.required.contains(&name) {
            self.schema.required.push(name.clone());
        }
        self.schema.properties.insert(name, prop);
        self
    }

    pub fn param_string(self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.property(name, JsonSchemaProperty::string(description), false)
    }

    pub fn required_string(self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.property(name, JsonSchemaProperty::string(description), true)
    }

    pub fn required_integer(self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.property(name, JsonSchemaProperty::integer(description).minimum(0.0), true)
    }

    pub fn param_integer(self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.property(name, JsonSchemaProperty::integer(description).minimum(0.0), false)
    }

    pub fn param_boolean(self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.property(name, JsonSchemaProperty::boolean(description), false)
    }

    /// 必填的字符串枚举
    pub fn required_enum(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        values: &[&str],
    ) -> Self {
        self.property(
            name,
            JsonSchemaProperty::string(description).enum_values(values),
            true,
        )
    }

    pub fn build(self) -> JsonSchema {
        self.schema
    }
}

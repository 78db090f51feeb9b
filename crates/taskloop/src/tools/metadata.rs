//! Structured tool metadata.
//!
//! A [`ToolMetadata`] is what a tool declares about itself: its name, the
//! description shown to the planner, a flat parameter list and capability
//! flags. The JSON Schema used for argument validation and for the
//! function-calling catalog is derived from the parameter list, so the two
//! can never drift apart.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ToolDef;

/// Broad capability group, used for filtering and planner prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Web,
    Code,
    File,
    System,
    Research,
    Communication,
    Data,
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolCategory::Web => "web",
            ToolCategory::Code => "code",
            ToolCategory::File => "file",
            ToolCategory::System => "system",
            ToolCategory::Research => "research",
            ToolCategory::Communication => "communication",
            ToolCategory::Data => "data",
        };
        f.write_str(s)
    }
}

/// JSON type of a single parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(ParamType::String),
            "integer" => Some(ParamType::Integer),
            "number" => Some(ParamType::Number),
            "boolean" => Some(ParamType::Boolean),
            "array" => Some(ParamType::Array),
            "object" => Some(ParamType::Object),
            _ => None,
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl ToolParameter {
    pub fn required(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Everything a tool declares about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub parameters: Vec<ToolParameter>,
    /// Destructive or otherwise risky; subject to the dangerous-tool policy.
    pub dangerous: bool,
    pub requires_network: bool,
    pub requires_filesystem: bool,
    pub estimated_cost_usd: f64,
}

impl ToolMetadata {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: ToolCategory,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category,
            parameters: Vec::new(),
            dangerous: false,
            requires_network: false,
            requires_filesystem: false,
            estimated_cost_usd: 0.0,
        }
    }

    pub fn param(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Replace the parameter list with one derived from an argument type.
    pub fn params_from<T: JsonSchema>(mut self) -> Self {
        self.parameters = parameters_for::<T>();
        self
    }

    pub fn dangerous(mut self) -> Self {
        self.dangerous = true;
        self
    }

    pub fn network(mut self) -> Self {
        self.requires_network = true;
        self
    }

    pub fn filesystem(mut self) -> Self {
        self.requires_filesystem = true;
        self
    }

    pub fn estimated_cost(mut self, usd: f64) -> Self {
        self.estimated_cost_usd = usd;
        self
    }

    /// JSON Schema (object) for the declared parameters.
    pub fn json_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            let mut prop = serde_json::json!({
                "type": p.param_type.as_str(),
                "description": p.description,
            });
            if let Some(ref default) = p.default {
                prop["default"] = default.clone();
            }
            properties.insert(p.name.clone(), prop);
            if p.required {
                required.push(serde_json::Value::String(p.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Function-calling definition for the completion service.
    pub fn to_tool_def(&self) -> ToolDef {
        ToolDef::new(self.name.clone(), self.description.clone(), self.json_schema())
    }

    /// One-line-per-parameter description for prompts.
    pub fn describe(&self) -> String {
        let mut out = format!("- {} [{}]: {}", self.name, self.category, self.description);
        if self.dangerous {
            out.push_str(" (dangerous)");
        }
        for p in &self.parameters {
            out.push_str(&format!(
                "\n    {} ({}{}): {}",
                p.name,
                p.param_type.as_str(),
                if p.required { ", required" } else { "" },
                p.description
            ));
        }
        out
    }
}

/// Derive a flat parameter list from a `schemars` argument type.
///
/// Top-level properties become parameters; `Option<T>` fields (schema type
/// `[T, "null"]`) map to `T`. Properties with no recognizable type are
/// treated as strings.
pub fn parameters_for<T: JsonSchema>() -> Vec<ToolParameter> {
    let schema = crate::json_schema_for::<T>();
    let required: Vec<&str> = schema["required"]
        .as_array()
        .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let Some(properties) = schema["properties"].as_object() else {
        return Vec::new();
    };

    properties
        .iter()
        .map(|(name, prop)| {
            let param_type = match &prop["type"] {
                serde_json::Value::String(s) => ParamType::parse(s),
                serde_json::Value::Array(types) => types
                    .iter()
                    .filter_map(|t| t.as_str())
                    .find(|t| *t != "null")
                    .and_then(ParamType::parse),
                _ => None,
            }
            .unwrap_or(ParamType::String);

            ToolParameter {
                name: name.clone(),
                param_type,
                description: prop["description"].as_str().unwrap_or_default().to_string(),
                required: required.contains(&name.as_str()),
                default: prop.get("default").cloned(),
            }
        })
        .collect()
}

//! 顶层文档处理请求

use serde::{Deserialize, Serialize};

use crate::models::backend::ParseBackend;
use crate::models::enrichment::VisionOptions;
use crate::models::job::{Priority, SlotSelector};

/// 单个文档的处理请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRequest {
    /// 输入文档引用
    pub input_ref: String,
    /// 结构化模式：保留页眉页脚并输出结构标签
    #[serde(default)]
    pub preserve_structure: bool,
    /// 是否生成扁平化文本
    #[serde(default)]
    pub return_text: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub required_slot: SlotSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<ParseBackend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub vision: VisionOptions,
    /// 输出文件名（不含扩展名），批处理时使用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DocumentRequest {
    pub fn new(input_ref: impl Into<String>) -> Self {
        Self {
            input_ref: input_ref.into(),
            preserve_structure: false,
            return_text: false,
            priority: Priority::Normal,
            required_slot: SlotSelector::Any,
            backend: None,
            timeout_seconds: None,
            vision: VisionOptions::default(),
            name: None,
        }
    }

    pub fn with_structure(mut self, preserve: bool) -> Self {
        self.preserve_structure = preserve;
        self
    }

    pub fn with_text(mut self, return_text: bool) -> Self {
        self.return_text = return_text;
        self
    }

    pub fn with_slot(mut self, slot: SlotSelector) -> Self {
        self.required_slot = slot;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    /// 输出文件名：优先使用 `name`，否则取输入文件名主干
    pub fn output_stem(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.trim().to_string();
        }
        std::path::Path::new(&self.input_ref)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "document".to_string())
    }
}

/// 请求清单（一个 TOML 文件可以包含多个请求）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestManifest {
    #[serde(default)]
    pub requests: Vec<DocumentRequest>,
}

//! 聚合结果：合并后的有序输出

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// 聚合状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateStatus {
    Success,
    Partial,
    Failure,
}

/// 结构化模式下输出的结构标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureTag {
    Title,
    Header,
    Footer,
}

/// 输出元素
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputElement {
    pub text: String,
    pub page_number: u32,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<StructureTag>,
    /// 对应解析结果中的 `index`
    pub source_index: usize,
}

/// 单个元素的失败标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementFailure {
    pub source_index: usize,
    pub image_ref: String,
    pub reason: String,
}

/// 请求的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub status: AggregateStatus,
    pub elements: Vec<OutputElement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ElementFailure>,
    /// 扁平化文本（仅在请求时生成）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
}

impl AggregateResult {
    /// 失败结果：没有输出元素，携带导致失败的错误
    pub fn failed(error: PipelineError) -> Self {
        Self {
            status: AggregateStatus::Failure,
            elements: Vec::new(),
            failures: Vec::new(),
            text: None,
            error: Some(error),
        }
    }

    pub fn texts(&self) -> Vec<&str> {
        self.elements.iter().map(|e| e.text.as_str()).collect()
    }
}

//! 视觉增强作业与结果

use serde::{Deserialize, Serialize};

use crate::models::backend::VisionProvider;

/// 增强结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrichmentStatus {
    Success,
    Failure,
}

/// 单张图片的增强结果，按 `image_ref` 归档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub image_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub status: EnrichmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnrichmentResult {
    pub fn success(image_ref: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            image_ref: image_ref.into(),
            text: Some(text.into()),
            status: EnrichmentStatus::Success,
            error: None,
        }
    }

    pub fn failure(image_ref: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            image_ref: image_ref.into(),
            text: None,
            status: EnrichmentStatus::Failure,
            error: Some(error.into()),
        }
    }

    /// 成功且描述非空时返回描述文本
    pub fn usable_text(&self) -> Option<&str> {
        match (self.status, self.text.as_deref()) {
            (EnrichmentStatus::Success, Some(text)) if !text.trim().is_empty() => Some(text),
            _ => None,
        }
    }
}

/// 单次请求的视觉选项
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<VisionProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// 覆盖默认提示词
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// 增强作业负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentJob {
    pub image_ref: String,
    /// 标题、脚注与前后文拼接而成的上下文
    #[serde(default)]
    pub context: String,
    /// 图片原有文本（标题），失败时原样保留
    #[serde(default)]
    pub base_text: String,
    #[serde(default)]
    pub page_number: u32,
    #[serde(default)]
    pub options: VisionOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_text() {
        assert_eq!(EnrichmentResult::success("a", "desc").usable_text(), Some("desc"));
        assert_eq!(EnrichmentResult::success("a", "  ").usable_text(), None);
        assert_eq!(EnrichmentResult::failure("a", "boom").usable_text(), None);
    }

    #[test]
    fn test_job_payload_defaults() {
        let job: EnrichmentJob = serde_json::from_str(r#"{"image_ref":"a.jpg"}"#).unwrap();
        assert_eq!(job.page_number, 0);
        assert!(job.context.is_empty());
        assert_eq!(job.options, VisionOptions::default());
    }
}

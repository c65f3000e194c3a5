//! 错误类型定义
//!
//! - `PipelineError`：流水线领域错误，会被写入作业状态与聚合结果，因此可序列化
//! - `ConfigError`：配置加载错误，启动时快速失败
//! - `AppError`：应用层统一错误

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::job::JobId;

/// 错误发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// 解析阶段（加速卡上的重任务）
    Parse,
    /// 视觉增强阶段
    Enrich,
    /// 合并阶段
    Merge,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Parse => "parse",
            Stage::Enrich => "enrich",
            Stage::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// 流水线错误
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    /// 请求参数不合法（未知槽位、空输入等），在创建任何作业之前返回
    #[error("参数校验失败: {message}")]
    Validation { message: String },

    /// 作业超过硬超时被强制终止
    #[error("作业 {job_id} 超过硬超时 {timeout_seconds}s，已强制终止")]
    ResourceTimeout { job_id: JobId, timeout_seconds: u64 },

    /// 外部后端失败，始终携带发生阶段
    #[error("[{stage}] 后端失败: {message}")]
    BackendFailure { stage: Stage, message: String },

    /// 部分增强失败
    #[error("部分增强失败: {failed}/{total}")]
    PartialFailure { failed: usize, total: usize },

    /// 汇合等待超时，`pending` 为始终未到达终态的增强作业
    #[error("汇合等待 {waited_seconds}s 超时，仍有 {} 个作业未完成", pending.len())]
    JoinTimeout {
        waited_seconds: u64,
        pending: Vec<JobId>,
    },

    /// 被调用方取消
    #[error("已取消")]
    Cancelled,

    /// 作业或请求不存在（或已过期清理）
    #[error("未找到: {id}")]
    NotFound { id: String },

    /// 调度器正在关闭，不再接收作业
    #[error("调度器正在关闭")]
    ShuttingDown,
}

impl PipelineError {
    /// 创建参数校验错误
    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation {
            message: message.into(),
        }
    }

    /// 创建后端失败错误
    pub fn backend(stage: Stage, message: impl Into<String>) -> Self {
        PipelineError::BackendFailure {
            stage,
            message: message.into(),
        }
    }

    /// 创建未找到错误
    pub fn not_found(id: impl fmt::Display) -> Self {
        PipelineError::NotFound { id: id.to_string() }
    }
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },

    /// 枚举取值不在支持列表中
    #[error("不支持的 {kind}: '{value}'，可选值: {supported}")]
    UnsupportedValue {
        kind: &'static str,
        value: String,
        supported: String,
    },

    /// 配置组合不合法
    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 流水线错误
    #[error("流水线错误: {0}")]
    Pipeline(#[from] PipelineError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 文件操作错误
    #[error("文件错误 ({path}): {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// JSON 解析失败
    #[error("JSON解析失败: {0}")]
    Json(#[from] serde_json::Error),
    /// TOML 解析失败
    #[error("TOML解析失败: {0}")]
    Toml(#[from] toml::de::Error),
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建文件操作错误
    pub fn file(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File {
            path: path.into(),
            source,
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

/// 流水线结果类型
pub type PipelineResult<T> = Result<T, PipelineError>;

//! 作业相关的基础类型
//!
//! 作业标识、槽位标识、优先级以及提交给调度器的解析作业。

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::models::backend::ParseBackend;

/// 作业唯一标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// 生成新的随机作业 ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 作业类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Parse,
    Enrich,
    Merge,
}

/// 作业优先级，仅影响增强队列的通道选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Urgent,
}

/// 作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failure,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }
}

/// 槽位标识（一张加速卡对应一个槽位）
///
/// 排序时纯数字 ID 按数值比较，`"2" < "10"`；其他 ID 按字典序排在数字之后。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl Ord for SlotId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for SlotId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 槽位选择：指定槽位或任意槽位
///
/// 序列化为字符串，`"any"` 表示任意槽位，其余视为槽位 ID。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SlotSelector {
    #[default]
    Any,
    Slot(SlotId),
}

impl From<String> for SlotSelector {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("any") {
            SlotSelector::Any
        } else {
            SlotSelector::Slot(SlotId::new(trimmed))
        }
    }
}

impl From<SlotSelector> for String {
    fn from(value: SlotSelector) -> Self {
        match value {
            SlotSelector::Any => "any".to_string(),
            SlotSelector::Slot(id) => id.0,
        }
    }
}

/// 提交给加速卡调度器的解析作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseJob {
    pub id: JobId,
    /// 不透明的输入引用（通常是文件路径）
    pub input_ref: String,
    pub required_slot: SlotSelector,
    pub priority: Priority,
    /// 硬超时；为空时使用调度器默认值
    pub timeout_seconds: Option<u64>,
    /// 解析后端；为空时使用配置默认值
    pub backend: Option<ParseBackend>,
}

impl ParseJob {
    pub fn new(input_ref: impl Into<String>) -> Self {
        Self {
            id: JobId::generate(),
            input_ref: input_ref.into(),
            required_slot: SlotSelector::Any,
            priority: Priority::Normal,
            timeout_seconds: None,
            backend: None,
        }
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

    pub fn with_backend(mut self, backend: ParseBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn kind(&self) -> JobKind {
        JobKind::Parse
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_id_orders_numerically() {
        let mut ids = vec![SlotId::new("10"), SlotId::new("2"), SlotId::new("gpu-a"), SlotId::new("0")];
        ids.sort();
        let ordered: Vec<&str> = ids.iter().map(SlotId::as_str).collect();
        assert_eq!(ordered, vec!["0", "2", "10", "gpu-a"]);
    }

    #[test]
    fn test_slot_selector_from_string() {
        assert_eq!(SlotSelector::from("any".to_string()), SlotSelector::Any);
        assert_eq!(SlotSelector::from(" ANY ".to_string()), SlotSelector::Any);
        assert_eq!(
            SlotSelector::from("1".to_string()),
            SlotSelector::Slot(SlotId::new("1"))
        );
    }

    #[test]
    fn test_parse_job_builder() {
        let job = ParseJob::new("docs/a.pdf")
            .with_slot(SlotSelector::Slot(SlotId::new("1")))
            .with_priority(Priority::Urgent)
            .with_timeout(5);
        assert_eq!(job.kind(), JobKind::Parse);
        assert_eq!(job.timeout_seconds, Some(5));
        assert_eq!(job.priority, Priority::Urgent);
        assert!(!job.id.as_str().is_empty());
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Failure.is_terminal());
    }
}

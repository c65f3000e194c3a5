//! 流程层（Workflow Layer）
//!
//! 定义"一个请求"从解析结果到最终输出的纯逻辑部分：
//!
//! - `image_jobs` - 挑选需要增强的图片并组装上下文
//! - `join_barrier` - 增强结果的计数汇合
//! - `merge` - 按原始顺序合并解析结果与增强结果
//!
//! 本层不持有任何资源，不做 IO，便于独立测试。

pub mod image_jobs;
pub mod join_barrier;
pub mod merge;

pub use image_jobs::{plan_enrichment, EnrichmentPlan, ImageFilter};
pub use join_barrier::{JoinBarrier, RecordOutcome};
pub use merge::{merge, merge_or_fail, AllFailedPolicy, MergeOptions};

//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责请求的阶段驱动和批量调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 批量请求处理器
//! - 管理应用生命周期（初始化、运行、关闭）
//! - 批量加载请求清单（Vec<DocumentRequest>）
//! - 控制并发数量（Semaphore）
//! - 写出结果文件并输出全局统计信息
//!
//! ### `stage_orchestrator` - 单个请求的两阶段编排
//! - 提交解析作业，等待解析终态
//! - 扇出增强作业，计数汇合
//! - 调用合并器，保存并对外提供最终结果
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<DocumentRequest>)
//!     ↓
//! stage_orchestrator (处理单个 DocumentRequest)
//!     ↓
//! workflow (纯逻辑：image_jobs / join_barrier / merge)
//!     ↓
//! scheduler + services (能力层：加速卡槽位 / 视觉模型)
//!     ↓
//! infrastructure (基础设施：ProcessWorker / WorkQueue)
//! ```

pub mod batch_processor;
pub mod stage_orchestrator;

// 重新导出主要类型
pub use batch_processor::App;
pub use stage_orchestrator::{
    JobRef, OrchestratorConfig, RequestState, RequestView, StageOrchestrator, StageState,
};

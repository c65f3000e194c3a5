//! # GPU Parse Pipeline
//!
//! 加速卡调度的两阶段文档处理流水线：先在独占槽位上解析文档，
//! 再把图片扇出给视觉模型增强，最后按原始顺序合并。
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有进程和队列资源，只暴露能力
//! - `ProcessWorker` - 在独立进程组中执行一次解析，负责超时终止和临时目录回收
//! - `WorkQueue` - 按通道组织的增强作业队列，终态广播通知
//!
//! ### ② 调度层（Scheduler）
//! - `scheduler/` - 每张加速卡一个槽位，槽位内严格 FIFO、同一时刻只跑一个作业
//!
//! ### ③ 业务能力层（Services）
//! - `VisionService` - 调用视觉模型描述单张图片
//! - `EnrichmentWorkerPool` - 消费增强队列
//!
//! ### ④ 流程层（Workflow）
//! - `image_jobs` - 挑选需要增强的图片
//! - `JoinBarrier` - 增强结果计数汇合
//! - `merge` - 合并解析结果与增强结果
//!
//! ### ⑤ 编排层（Orchestration）
//! - `orchestrator/stage_orchestrator` - 单个请求的状态机
//! - `orchestrator/batch_processor` - 批量请求处理器，管理资源和并发
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod scheduler;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult, ConfigError, PipelineError, PipelineResult, Stage};
pub use infrastructure::{InMemoryWorkQueue, ProcessWorker, WorkQueue};
pub use models::{AggregateResult, AggregateStatus, DocumentRequest, ParseResult, StructuralElement};
pub use orchestrator::{App, RequestView, StageOrchestrator};
pub use scheduler::{JobHandle, SchedulerConfig, SchedulerState};

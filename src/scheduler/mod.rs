//! 加速卡调度器
//!
//! ## 职责
//!
//! 管理一组固定的独占槽位（一张加速卡一个槽位），负责解析作业的准入、排队和执行。
//!
//! ## 核心功能
//!
//! 1. **准入**：指定槽位必须存在；`any` 选择负载最小的槽位，平局取 ID 最小者
//! 2. **FIFO**：每个槽位严格按提交顺序串行执行，作业不会在槽位间迁移
//! 3. **隔离**：作业在独立进程中执行，崩溃只影响该作业
//! 4. **硬超时**：超时作业连同其后代进程被强制终止，槽位立即开始下一个作业
//! 5. **关闭**：停止准入，拒绝排队作业，等待正在运行的作业结束
//!
//! ## 设计特点
//!
//! - 调度器状态由启动时显式构造并传递，没有全局单例
//! - 每个槽位只有一个写者（槽位运行器），调度器只读看板并投递命令

pub mod handle;
pub mod slot;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::infrastructure::ProcessWorker;
use crate::models::{JobId, ParseBackend, ParseJob, SlotId, SlotSelector};

pub use handle::{JobHandle, JobSnapshot};
pub use slot::SlotStatus;

use handle::JobTable;
use slot::{SharedBoard, SlotBoard, SlotCommand, SlotRunner};

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub slots: Vec<SlotId>,
    pub default_timeout: Duration,
    pub default_backend: ParseBackend,
    /// 终态作业的保留时长
    pub result_ttl: Duration,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            slots: config.gpu_ids.clone(),
            default_timeout: Duration::from_secs(config.parse_hard_timeout_seconds),
            default_backend: config.default_backend,
            result_ttl: config.result_ttl(),
        }
    }
}

fn poison_err<T>(_: PoisonError<T>) -> PipelineError {
    PipelineError::backend(Stage::Parse, "scheduler lock poisoned")
}

/// 调度器状态
pub struct SchedulerState {
    senders: BTreeMap<SlotId, mpsc::UnboundedSender<SlotCommand>>,
    board: SharedBoard,
    jobs: Arc<JobTable>,
    runners: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerState {
    /// 启动调度器，为每个槽位创建运行器
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn start(config: SchedulerConfig, worker: ProcessWorker) -> PipelineResult<Self> {
        if config.slots.is_empty() {
            return Err(PipelineError::validation("至少需要一个槽位"));
        }

        let slots: BTreeMap<SlotId, slot::SlotStatus> = config
            .slots
            .iter()
            .map(|id| (id.clone(), SlotStatus::default()))
            .collect();
        if slots.len() != config.slots.len() {
            return Err(PipelineError::validation("槽位 ID 重复"));
        }

        let board: SharedBoard = Arc::new(Mutex::new(SlotBoard {
            accepting: true,
            slots,
        }));
        let jobs = Arc::new(JobTable::new(config.result_ttl));

        let mut senders = BTreeMap::new();
        let mut runners = Vec::new();
        for slot_id in &config.slots {
            let (tx, rx) = mpsc::unbounded_channel();
            let runner = SlotRunner::new(
                slot_id.clone(),
                rx,
                board.clone(),
                jobs.clone(),
                worker.clone(),
                config.default_timeout,
                config.default_backend,
            );
            runners.push(tokio::spawn(runner.run()));
            senders.insert(slot_id.clone(), tx);
        }

        info!("🖥️ 调度器已启动，共 {} 个槽位", senders.len());

        Ok(Self {
            senders,
            board,
            jobs,
            runners: Mutex::new(runners),
        })
    }

    /// 提交解析作业
    ///
    /// # 返回
    /// 返回作业句柄；未知槽位或非法参数返回 `Validation`，关闭中返回 `ShuttingDown`
    pub fn submit(&self, job: ParseJob) -> PipelineResult<JobHandle> {
        if job.input_ref.trim().is_empty() {
            return Err(PipelineError::validation("input_ref 不能为空"));
        }
        if job.timeout_seconds == Some(0) {
            return Err(PipelineError::validation("timeout_seconds 必须大于 0"));
        }

        let mut board = self.board.lock().map_err(poison_err)?;
        if !board.accepting {
            return Err(PipelineError::ShuttingDown);
        }

        let slot_id = match &job.required_slot {
            SlotSelector::Slot(id) if board.slots.contains_key(id) => id.clone(),
            SlotSelector::Slot(id) => {
                return Err(PipelineError::validation(format!("未知槽位: {}", id)));
            }
            // 看板按槽位 ID 有序，min_by_key 在平局时返回第一个
            SlotSelector::Any => board
                .slots
                .iter()
                .min_by_key(|(_, status)| status.load())
                .map(|(id, _)| id.clone())
                .ok_or_else(|| PipelineError::validation("没有可用槽位"))?,
        };

        let sender = self
            .senders
            .get(&slot_id)
            .ok_or_else(|| PipelineError::validation(format!("未知槽位: {}", slot_id)))?;

        let job_id = job.id.clone();
        let handle = self.jobs.register(&job_id, &slot_id)?;
        if sender.send(SlotCommand::Enqueue(job)).is_err() {
            let error = PipelineError::backend(Stage::Parse, format!("槽位 {} 运行器已停止", slot_id));
            self.jobs.finish(&job_id, Err(error.clone()));
            return Err(error);
        }
        if let Some(status) = board.slots.get_mut(&slot_id) {
            status.queue_depth += 1;
        }
        drop(board);

        info!("[槽位 {}] 📥 作业 {} 已提交", slot_id, job_id);
        Ok(handle)
    }

    /// 各槽位状态快照
    pub fn status(&self) -> PipelineResult<BTreeMap<SlotId, SlotStatus>> {
        let board = self.board.lock().map_err(poison_err)?;
        Ok(board.slots.clone())
    }

    /// 排队与运行中的作业总数
    pub fn total_pending(&self) -> PipelineResult<usize> {
        Ok(self.status()?.values().map(SlotStatus::load).sum())
    }

    /// 查询作业状态；过期作业返回 `NotFound`
    pub fn get_state(&self, job_id: &JobId) -> PipelineResult<JobSnapshot> {
        self.jobs.snapshot(job_id)
    }

    /// 取消作业
    ///
    /// 排队中的作业直接移出队列；运行中的作业终止其进程组。
    /// 作业已结束时返回 `false`。
    pub async fn cancel(&self, job_id: &JobId) -> PipelineResult<bool> {
        let snapshot = self.jobs.snapshot(job_id)?;
        if snapshot.state.is_terminal() {
            return Ok(false);
        }
        let Some(sender) = self.senders.get(&snapshot.slot_id) else {
            return Ok(false);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let command = SlotCommand::Cancel {
            job_id: job_id.clone(),
            reply: reply_tx,
        };
        if sender.send(command).is_err() {
            return Ok(false);
        }
        Ok(reply_rx.await.unwrap_or(false))
    }

    /// 关闭调度器：停止准入，拒绝排队作业，等待运行中的作业结束
    pub async fn shutdown(&self) {
        {
            let Ok(mut board) = self.board.lock() else {
                warn!("⚠️ 调度器看板锁已中毒，跳过关闭");
                return;
            };
            if !board.accepting {
                return;
            }
            board.accepting = false;
        }

        info!("🛑 调度器开始关闭");
        for sender in self.senders.values() {
            let _ = sender.send(SlotCommand::Shutdown);
        }

        let runners = match self.runners.lock() {
            Ok(mut runners) => std::mem::take(&mut *runners),
            Err(_) => Vec::new(),
        };
        for runner in runners {
            if let Err(e) = runner.await {
                warn!("⚠️ 槽位运行器异常退出: {}", e);
            }
        }
        info!("🛑 调度器已关闭");
    }
}

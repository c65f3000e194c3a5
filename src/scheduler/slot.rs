//! 槽位运行器
//!
//! 每个槽位由一个独立任务驱动，它是该槽位队列和运行状态的唯一写者：
//!
//! - 严格 FIFO，同一时刻最多运行一个作业
//! - 作业在隔离进程中执行，超时与取消由 `ProcessWorker` 负责终止
//! - 对外可见的状态发布到共享看板，供调度器做准入和状态查询

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::infrastructure::ProcessWorker;
use crate::models::{JobId, ParseBackend, ParseJob, ParseResult, SlotId};
use crate::scheduler::handle::JobTable;

/// 发给槽位运行器的命令
pub(crate) enum SlotCommand {
    Enqueue(ParseJob),
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// 槽位状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub queue_depth: usize,
    pub running_job_id: Option<JobId>,
    pub running_since: Option<DateTime<Utc>>,
}

impl SlotStatus {
    /// 负载 = 排队数 + 正在运行数
    pub fn load(&self) -> usize {
        self.queue_depth + usize::from(self.running_job_id.is_some())
    }
}

/// 所有槽位的共享看板
#[derive(Debug)]
pub(crate) struct SlotBoard {
    pub(crate) accepting: bool,
    pub(crate) slots: BTreeMap<SlotId, SlotStatus>,
}

pub(crate) type SharedBoard = Arc<Mutex<SlotBoard>>;

struct RunningJob {
    job_id: JobId,
    handle: JoinHandle<PipelineResult<ParseResult>>,
    cancel: Option<oneshot::Sender<()>>,
}

pub(crate) struct SlotRunner {
    slot_id: SlotId,
    rx: mpsc::UnboundedReceiver<SlotCommand>,
    board: SharedBoard,
    jobs: Arc<JobTable>,
    worker: ProcessWorker,
    default_timeout: Duration,
    default_backend: ParseBackend,
    queue: VecDeque<ParseJob>,
    running: Option<RunningJob>,
    draining: bool,
    rx_closed: bool,
}

impl SlotRunner {
    pub(crate) fn new(
        slot_id: SlotId,
        rx: mpsc::UnboundedReceiver<SlotCommand>,
        board: SharedBoard,
        jobs: Arc<JobTable>,
        worker: ProcessWorker,
        default_timeout: Duration,
        default_backend: ParseBackend,
    ) -> Self {
        Self {
            slot_id,
            rx,
            board,
            jobs,
            worker,
            default_timeout,
            default_backend,
            queue: VecDeque::new(),
            running: None,
            draining: false,
            rx_closed: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("[槽位 {}] 🟢 槽位已就绪", self.slot_id);

        loop {
            if self.running.is_none() {
                self.start_next();
            }
            if self.draining && self.running.is_none() {
                break;
            }

            tokio::select! {
                command = self.rx.recv(), if !self.rx_closed => self.handle_command(command),
                (job_id, outcome) = join_running(&mut self.running), if self.running.is_some() => {
                    self.finish(job_id, outcome);
                }
            }
        }

        info!("[槽位 {}] ⏹ 槽位已停止", self.slot_id);
    }

    fn handle_command(&mut self, command: Option<SlotCommand>) {
        match command {
            Some(SlotCommand::Enqueue(job)) => {
                if self.draining {
                    self.reject(job, PipelineError::ShuttingDown);
                } else {
                    debug!("[槽位 {}] 作业 {} 进入队列", self.slot_id, job.id);
                    self.queue.push_back(job);
                }
            }
            Some(SlotCommand::Cancel { job_id, reply }) => {
                let cancelled = self.cancel(&job_id);
                let _ = reply.send(cancelled);
            }
            Some(SlotCommand::Shutdown) => self.begin_drain(),
            None => {
                self.rx_closed = true;
                self.begin_drain();
            }
        }
    }

    fn start_next(&mut self) {
        let Some(job) = self.queue.pop_front() else {
            return;
        };

        let backend = job.backend.unwrap_or(self.default_backend).resolve();
        let timeout = job
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let job_id = job.id.clone();

        self.with_status(|status| {
            status.queue_depth = status.queue_depth.saturating_sub(1);
            status.running_job_id = Some(job_id.clone());
            status.running_since = Some(Utc::now());
        });
        self.jobs.mark_running(&job_id);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let worker = self.worker.clone();
        let slot_id = self.slot_id.clone();
        let handle = tokio::spawn(async move {
            worker.run(&job, &slot_id, backend, timeout, cancel_rx).await
        });

        self.running = Some(RunningJob {
            job_id,
            handle,
            cancel: Some(cancel_tx),
        });
    }

    fn finish(&mut self, job_id: JobId, outcome: PipelineResult<ParseResult>) {
        match &outcome {
            Ok(result) => info!(
                "[槽位 {}] ✓ 作业 {} 完成，共 {} 个元素",
                self.slot_id,
                job_id,
                result.elements.len()
            ),
            Err(PipelineError::ResourceTimeout { timeout_seconds, .. }) => warn!(
                "[槽位 {}] ⏰ 作业 {} 超过 {}s，已强制终止",
                self.slot_id, job_id, timeout_seconds
            ),
            Err(PipelineError::Cancelled) => info!("[槽位 {}] 🚫 作业 {} 已取消", self.slot_id, job_id),
            Err(e) => error!("[槽位 {}] ❌ 作业 {} 失败: {}", self.slot_id, job_id, e),
        }

        self.jobs.finish(&job_id, outcome.map(Arc::new));
        self.with_status(|status| {
            status.running_job_id = None;
            status.running_since = None;
        });
        self.running = None;
    }

    fn cancel(&mut self, job_id: &JobId) -> bool {
        if let Some(running) = self.running.as_mut().filter(|r| &r.job_id == job_id) {
            if let Some(cancel) = running.cancel.take() {
                let _ = cancel.send(());
            }
            return true;
        }

        match self.queue.iter().position(|job| &job.id == job_id) {
            Some(position) => {
                if let Some(job) = self.queue.remove(position) {
                    self.reject(job, PipelineError::Cancelled);
                }
                true
            }
            None => false,
        }
    }

    fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;

        let queued: Vec<ParseJob> = self.queue.drain(..).collect();
        if !queued.is_empty() {
            warn!(
                "[槽位 {}] ⚠️ 调度器关闭，拒绝 {} 个排队作业",
                self.slot_id,
                queued.len()
            );
        }
        for job in queued {
            self.reject(job, PipelineError::ShuttingDown);
        }
    }

    /// 未运行即结束的作业
    fn reject(&self, job: ParseJob, error: PipelineError) {
        self.with_status(|status| {
            status.queue_depth = status.queue_depth.saturating_sub(1);
        });
        self.jobs.finish(&job.id, Err(error));
    }

    fn with_status(&self, apply: impl FnOnce(&mut SlotStatus)) {
        match self.board.lock() {
            Ok(mut board) => {
                if let Some(status) = board.slots.get_mut(&self.slot_id) {
                    apply(status);
                }
            }
            Err(_) => error!("[槽位 {}] 看板锁已中毒", self.slot_id),
        }
    }
}

async fn join_running(running: &mut Option<RunningJob>) -> (JobId, PipelineResult<ParseResult>) {
    let Some(job) = running.as_mut() else {
        return std::future::pending().await;
    };
    let outcome = match (&mut job.handle).await {
        Ok(outcome) => outcome,
        Err(e) => Err(PipelineError::backend(
            Stage::Parse,
            format!("worker 任务异常终止: {}", e),
        )),
    };
    (job.job_id.clone(), outcome)
}

//! 工作队列：按通道（lane）组织的作业队列
//!
//! ## 职责
//!
//! - 生产端：`enqueue` 持久化作业并返回作业 ID，`get_state` 查询状态
//! - 消费端：`dequeue` 按通道优先级取作业，`complete` 写入终态
//! - 通知：终态变化通过广播推送给订阅者
//!
//! ## 语义
//!
//! - 至少一次投递，消费方需要幂等
//! - 终态不可变：对已终结作业的重复 `complete` 会被忽略
//! - 终态结果保留 `result_ttl`，过期后查询返回 `NotFound`
//! - 通道只提供粗粒度优先级，不抢占正在执行的作业

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::models::job::{JobId, JobKind, JobState};

/// 队列通道名称
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lane(String);

impl Lane {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 待入队的作业
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: JsonValue,
    /// 所属的上层请求
    pub parent_id: Option<JobId>,
}

/// 已入队的作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub lane: Lane,
    pub kind: JobKind,
    pub payload: JsonValue,
    pub parent_id: Option<JobId>,
}

/// 作业状态（终态携带结果或错误）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success { result: JsonValue },
    Failure { error: PipelineError },
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        match self {
            JobStatus::Pending => JobState::Pending,
            JobStatus::Running => JobState::Running,
            JobStatus::Success { .. } => JobState::Success,
            JobStatus::Failure { .. } => JobState::Failure,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

/// 终态通知
#[derive(Debug, Clone)]
pub struct TerminalEvent {
    pub job_id: JobId,
    pub parent_id: Option<JobId>,
    pub status: JobStatus,
}

/// 队列统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub finished: usize,
    pub total_enqueued: u64,
}

/// 工作队列契约
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// 入队并返回作业 ID
    async fn enqueue(&self, lane: &Lane, job: NewJob) -> PipelineResult<JobId>;

    /// 查询作业状态
    async fn get_state(&self, job_id: &JobId) -> PipelineResult<JobStatus>;

    /// 等待下一个作业，`lanes` 按优先级从高到低排列
    async fn dequeue(&self, lanes: &[Lane]) -> PipelineResult<QueuedJob>;

    /// 写入终态
    async fn complete(&self, job_id: &JobId, outcome: PipelineResult<JsonValue>) -> PipelineResult<()>;

    /// 订阅终态通知
    fn subscribe(&self) -> broadcast::Receiver<TerminalEvent>;
}

#[derive(Debug)]
struct Entry {
    job: QueuedJob,
    status: JobStatus,
    finished_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct QueueState {
    lanes: HashMap<Lane, VecDeque<JobId>>,
    entries: HashMap<JobId, Entry>,
    total_enqueued: u64,
}

impl QueueState {
    /// 清理已过期的终态作业
    fn purge_expired(&mut self, ttl: Duration, now: Instant) {
        self.entries.retain(|_, entry| match entry.finished_at {
            Some(finished_at) => now.duration_since(finished_at) < ttl,
            None => true,
        });
    }

    fn pop(&mut self, lanes: &[Lane]) -> Option<QueuedJob> {
        for lane in lanes {
            let Some(queue) = self.lanes.get_mut(lane) else {
                continue;
            };
            while let Some(job_id) = queue.pop_front() {
                if let Some(entry) = self.entries.get_mut(&job_id) {
                    if entry.status == JobStatus::Pending {
                        entry.status = JobStatus::Running;
                        return Some(entry.job.clone());
                    }
                }
            }
        }
        None
    }
}

fn poison_err<T>(_: PoisonError<T>) -> PipelineError {
    PipelineError::backend(Stage::Enrich, "work queue lock poisoned")
}

/// 进程内工作队列
///
/// 单进程使用，不跨进程持久化；终态结果在读写时惰性清理。
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    events: broadcast::Sender<TerminalEvent>,
    result_ttl: Duration,
}

impl InMemoryWorkQueue {
    pub fn new(result_ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            events,
            result_ttl,
        }
    }

    /// 当前队列统计
    pub fn stats(&self) -> PipelineResult<QueueStats> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.purge_expired(self.result_ttl, Instant::now());
        let mut stats = QueueStats {
            total_enqueued: state.total_enqueued,
            ..Default::default()
        };
        for entry in state.entries.values() {
            match entry.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                _ => stats.finished += 1,
            }
        }
        Ok(stats)
    }

    fn try_dequeue(&self, lanes: &[Lane]) -> PipelineResult<Option<QueuedJob>> {
        let mut state = self.state.lock().map_err(poison_err)?;
        Ok(state.pop(lanes))
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, lane: &Lane, job: NewJob) -> PipelineResult<JobId> {
        let job_id = JobId::generate();
        {
            let mut state = self.state.lock().map_err(poison_err)?;
            state.purge_expired(self.result_ttl, Instant::now());
            let queued = QueuedJob {
                id: job_id.clone(),
                lane: lane.clone(),
                kind: job.kind,
                payload: job.payload,
                parent_id: job.parent_id,
            };
            state.entries.insert(
                job_id.clone(),
                Entry {
                    job: queued,
                    status: JobStatus::Pending,
                    finished_at: None,
                },
            );
            state.lanes.entry(lane.clone()).or_default().push_back(job_id.clone());
            state.total_enqueued += 1;
        }
        debug!("作业 {} 已进入通道 {}", job_id, lane);
        // 消费者可能只监听部分通道，需要全部唤醒后各自检查
        self.notify.notify_waiters();
        Ok(job_id)
    }

    async fn get_state(&self, job_id: &JobId) -> PipelineResult<JobStatus> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.purge_expired(self.result_ttl, Instant::now());
        state
            .entries
            .get(job_id)
            .map(|entry| entry.status.clone())
            .ok_or_else(|| PipelineError::not_found(job_id))
    }

    async fn dequeue(&self, lanes: &[Lane]) -> PipelineResult<QueuedJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // 先登记等待再检查队列，避免漏掉检查与等待之间的入队
            notified.as_mut().enable();

            if let Some(job) = self.try_dequeue(lanes)? {
                return Ok(job);
            }
            notified.await;
        }
    }

    async fn complete(&self, job_id: &JobId, outcome: PipelineResult<JsonValue>) -> PipelineResult<()> {
        let event = {
            let mut state = self.state.lock().map_err(poison_err)?;
            let entry = state
                .entries
                .get_mut(job_id)
                .ok_or_else(|| PipelineError::not_found(job_id))?;

            if entry.status.is_terminal() {
                debug!("作业 {} 已是终态，忽略重复完成", job_id);
                return Ok(());
            }

            entry.status = match outcome {
                Ok(result) => JobStatus::Success { result },
                Err(error) => JobStatus::Failure { error },
            };
            entry.finished_at = Some(Instant::now());

            TerminalEvent {
                job_id: job_id.clone(),
                parent_id: entry.job.parent_id.clone(),
                status: entry.status.clone(),
            }
        };

        // 没有订阅者时发送失败是正常情况
        let _ = self.events.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn new_job(n: u64) -> NewJob {
        NewJob {
            kind: JobKind::Enrich,
            payload: json!({ "n": n }),
            parent_id: Some(JobId::from("parent")),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_complete() {
        let queue = InMemoryWorkQueue::new(Duration::from_secs(60));
        let lane = Lane::new("normal");
        let mut events = queue.subscribe();

        let id = queue.enqueue(&lane, new_job(1)).await.unwrap();
        assert_eq!(queue.get_state(&id).await.unwrap(), JobStatus::Pending);

        let job = queue.dequeue(&[lane.clone()]).await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.payload, json!({ "n": 1 }));
        assert_eq!(queue.get_state(&id).await.unwrap(), JobStatus::Running);

        queue.complete(&id, Ok(json!("done"))).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, id);
        assert_eq!(event.parent_id, Some(JobId::from("parent")));
        assert_eq!(event.status.state(), JobState::Success);
    }

    #[tokio::test]
    async fn test_terminal_state_is_immutable() {
        let queue = InMemoryWorkQueue::new(Duration::from_secs(60));
        let lane = Lane::new("normal");
        let id = queue.enqueue(&lane, new_job(1)).await.unwrap();
        queue.dequeue(&[lane]).await.unwrap();

        queue.complete(&id, Err(PipelineError::Cancelled)).await.unwrap();
        queue.complete(&id, Ok(json!("late"))).await.unwrap();

        assert_eq!(
            queue.get_state(&id).await.unwrap(),
            JobStatus::Failure {
                error: PipelineError::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn test_urgent_lane_drained_first() {
        let queue = InMemoryWorkQueue::new(Duration::from_secs(60));
        let normal = Lane::new("normal");
        let urgent = Lane::new("urgent");

        let n1 = queue.enqueue(&normal, new_job(1)).await.unwrap();
        let u1 = queue.enqueue(&urgent, new_job(2)).await.unwrap();
        let n2 = queue.enqueue(&normal, new_job(3)).await.unwrap();

        let lanes = [urgent, normal];
        let order = vec![
            queue.dequeue(&lanes).await.unwrap().id,
            queue.dequeue(&lanes).await.unwrap().id,
            queue.dequeue(&lanes).await.unwrap().id,
        ];
        assert_eq!(order, vec![u1, n1, n2]);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = Arc::new(InMemoryWorkQueue::new(Duration::from_secs(60)));
        let lane = Lane::new("normal");

        let consumer = {
            let queue = queue.clone();
            let lane = lane.clone();
            tokio::spawn(async move { queue.dequeue(&[lane]).await })
        };
        tokio::task::yield_now().await;

        let id = queue.enqueue(&lane, new_job(7)).await.unwrap();
        let job = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_purged_after_ttl() {
        let queue = InMemoryWorkQueue::new(Duration::from_secs(10));
        let lane = Lane::new("normal");
        let id = queue.enqueue(&lane, new_job(1)).await.unwrap();
        queue.dequeue(&[lane]).await.unwrap();
        queue.complete(&id, Ok(json!(1))).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(queue.get_state(&id).await.is_ok());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(
            queue.get_state(&id).await,
            Err(PipelineError::not_found(&id))
        );
    }

    #[tokio::test]
    async fn test_unknown_job_not_found() {
        let queue = InMemoryWorkQueue::new(Duration::from_secs(60));
        let missing = JobId::from("missing");
        assert!(matches!(
            queue.get_state(&missing).await,
            Err(PipelineError::NotFound { .. })
        ));
        assert!(queue.complete(&missing, Ok(json!(null))).await.is_err());
    }

    #[tokio::test]
    async fn test_stats() {
        let queue = InMemoryWorkQueue::new(Duration::from_secs(60));
        let lane = Lane::new("normal");
        let a = queue.enqueue(&lane, new_job(1)).await.unwrap();
        queue.enqueue(&lane, new_job(2)).await.unwrap();
        queue.enqueue(&lane, new_job(3)).await.unwrap();
        queue.dequeue(&[lane.clone()]).await.unwrap();
        queue.dequeue(&[lane]).await.unwrap();
        queue.complete(&a, Ok(json!(1))).await.unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 1,
                running: 1,
                finished: 1,
                total_enqueued: 3
            }
        );
    }
}

//! 解析作业的状态快照、等待句柄与作业表

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::models::{JobId, JobState, ParseResult, SlotId};

/// 解析作业状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub slot_id: SlotId,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Arc<ParseResult>>,
    pub error: Option<PipelineError>,
}

impl JobSnapshot {
    fn pending(job_id: JobId, slot_id: SlotId) -> Self {
        Self {
            job_id,
            slot_id,
            state: JobState::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    /// 终态结果
    pub fn outcome(&self) -> Option<PipelineResult<Arc<ParseResult>>> {
        match self.state {
            JobState::Success => Some(
                self.result
                    .clone()
                    .ok_or_else(|| PipelineError::backend(Stage::Parse, "成功作业缺少解析结果")),
            ),
            JobState::Failure => Some(Err(self
                .error
                .clone()
                .unwrap_or_else(|| PipelineError::backend(Stage::Parse, "失败作业缺少错误信息")))),
            _ => None,
        }
    }
}

/// 作业等待句柄
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: JobId,
    rx: watch::Receiver<JobSnapshot>,
}

impl JobHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// 当前快照
    pub fn snapshot(&self) -> JobSnapshot {
        self.rx.borrow().clone()
    }

    /// 等待作业进入终态
    pub async fn wait(mut self) -> PipelineResult<Arc<ParseResult>> {
        let snapshot = self
            .rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .map(|snapshot| snapshot.clone())
            .map_err(|_| {
                PipelineError::backend(
                    Stage::Parse,
                    format!("作业 {} 在结束前被调度器丢弃", self.job_id),
                )
            })?;
        snapshot
            .outcome()
            .unwrap_or_else(|| Err(PipelineError::backend(Stage::Parse, "作业状态异常")))
    }
}

struct TableEntry {
    tx: watch::Sender<JobSnapshot>,
    finished_at: Option<Instant>,
}

fn poison_err<T>(_: PoisonError<T>) -> PipelineError {
    PipelineError::backend(Stage::Parse, "job table lock poisoned")
}

/// 作业表：作业 ID → 状态广播
pub(crate) struct JobTable {
    entries: Mutex<HashMap<JobId, TableEntry>>,
    ttl: Duration,
}

impl JobTable {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub(crate) fn register(&self, job_id: &JobId, slot_id: &SlotId) -> PipelineResult<JobHandle> {
        let (tx, rx) = watch::channel(JobSnapshot::pending(job_id.clone(), slot_id.clone()));
        let mut entries = self.entries.lock().map_err(poison_err)?;
        Self::purge(&mut entries, self.ttl);
        entries.insert(job_id.clone(), TableEntry { tx, finished_at: None });
        Ok(JobHandle {
            job_id: job_id.clone(),
            rx,
        })
    }

    pub(crate) fn mark_running(&self, job_id: &JobId) {
        self.update(job_id, |snapshot| {
            snapshot.state = JobState::Running;
            snapshot.started_at = Some(Utc::now());
        });
    }

    /// 写入终态；已是终态的作业保持不变
    pub(crate) fn finish(&self, job_id: &JobId, outcome: PipelineResult<Arc<ParseResult>>) {
        self.update(job_id, move |snapshot| {
            snapshot.finished_at = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    snapshot.state = JobState::Success;
                    snapshot.result = Some(result);
                }
                Err(error) => {
                    snapshot.state = JobState::Failure;
                    snapshot.error = Some(error);
                }
            }
        });
    }

    pub(crate) fn snapshot(&self, job_id: &JobId) -> PipelineResult<JobSnapshot> {
        let mut entries = self.entries.lock().map_err(poison_err)?;
        Self::purge(&mut entries, self.ttl);
        entries
            .get(job_id)
            .map(|entry| entry.tx.borrow().clone())
            .ok_or_else(|| PipelineError::not_found(job_id))
    }

    fn update(&self, job_id: &JobId, apply: impl FnOnce(&mut JobSnapshot)) {
        let Ok(mut entries) = self.entries.lock() else {
            tracing::error!("作业表锁已中毒，无法更新作业 {}", job_id);
            return;
        };
        let Some(entry) = entries.get_mut(job_id) else {
            return;
        };
        if entry.tx.borrow().state.is_terminal() {
            return;
        }
        entry.tx.send_modify(apply);
        if entry.tx.borrow().state.is_terminal() {
            entry.finished_at = Some(Instant::now());
        }
    }

    fn purge(entries: &mut HashMap<JobId, TableEntry>, ttl: Duration) {
        let now = Instant::now();
        entries.retain(|_, entry| match entry.finished_at {
            Some(finished_at) => now.duration_since(finished_at) < ttl,
            None => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_resolves_on_terminal_state() {
        let table = JobTable::new(Duration::from_secs(60));
        let job_id = JobId::from("job-1");
        let handle = table.register(&job_id, &SlotId::new("0")).unwrap();

        table.mark_running(&job_id);
        assert_eq!(handle.snapshot().state, JobState::Running);

        let waiter = tokio::spawn(handle.clone().wait());
        table.finish(&job_id, Ok(Arc::new(ParseResult::default())));
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_terminal_snapshot_is_immutable() {
        let table = JobTable::new(Duration::from_secs(60));
        let job_id = JobId::from("job-1");
        table.register(&job_id, &SlotId::new("0")).unwrap();

        table.finish(&job_id, Err(PipelineError::Cancelled));
        table.finish(&job_id, Ok(Arc::new(ParseResult::default())));
        table.mark_running(&job_id);

        let snapshot = table.snapshot(&job_id).unwrap();
        assert_eq!(snapshot.state, JobState::Failure);
        assert_eq!(snapshot.error, Some(PipelineError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_jobs_expire() {
        let table = JobTable::new(Duration::from_secs(5));
        let job_id = JobId::from("job-1");
        table.register(&job_id, &SlotId::new("0")).unwrap();
        table.finish(&job_id, Err(PipelineError::Cancelled));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(table.snapshot(&job_id), Err(PipelineError::NotFound { .. })));
    }
}

//! 汇合屏障（chord）
//!
//! 以上层请求 ID 为键，记录期望的增强作业数与已到达的终态结果。
//! 只有在解析结果已就绪且 `received == expected` 时才释放，且只释放一次。
//! 计数只增不减，重复通知不会重复计数。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::{EnrichmentResult, JobId, ParseResult};

/// 记录一次终态后的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// 已计数，尚未满足汇合条件
    Recorded { received: usize, expected: usize },
    /// 本次记录使屏障释放
    Joined,
    /// 该作业已记录过
    Duplicate,
    /// 不属于本屏障的作业
    Unexpected,
}

#[derive(Debug, Default)]
struct BarrierState {
    /// 作业 ID → 图片引用
    expected: HashMap<JobId, String>,
    received: HashSet<JobId>,
    results: HashMap<String, EnrichmentResult>,
    parse_result: Option<Arc<ParseResult>>,
    released: bool,
}

impl BarrierState {
    fn try_release(&mut self) -> bool {
        if !self.released && self.parse_result.is_some() && self.received.len() == self.expected.len() {
            self.released = true;
            return true;
        }
        false
    }
}

/// 汇合屏障
#[derive(Debug)]
pub struct JoinBarrier {
    parent_id: JobId,
    state: Mutex<BarrierState>,
}

impl JoinBarrier {
    /// 创建屏障
    ///
    /// # 参数
    /// - `parent_id`: 上层请求 ID
    /// - `expected`: 期望的 (增强作业 ID, 图片引用)
    pub fn new(parent_id: JobId, expected: impl IntoIterator<Item = (JobId, String)>) -> Self {
        Self {
            parent_id,
            state: Mutex::new(BarrierState {
                expected: expected.into_iter().collect(),
                ..Default::default()
            }),
        }
    }

    pub fn parent_id(&self) -> &JobId {
        &self.parent_id
    }

    // 状态只做单调更新，中毒后继续使用内部数据
    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 附加解析结果；若所有增强已到达则释放
    pub fn attach_parse_result(&self, parse_result: Arc<ParseResult>) -> bool {
        let mut state = self.lock();
        if state.parse_result.is_none() {
            state.parse_result = Some(parse_result);
        }
        state.try_release()
    }

    /// 记录一个增强作业的终态
    pub fn record(&self, job_id: &JobId, result: EnrichmentResult) -> RecordOutcome {
        let mut state = self.lock();
        let Some(image_ref) = state.expected.get(job_id).cloned() else {
            return RecordOutcome::Unexpected;
        };
        if !state.received.insert(job_id.clone()) {
            return RecordOutcome::Duplicate;
        }
        state.results.insert(image_ref, result);

        if state.try_release() {
            RecordOutcome::Joined
        } else {
            RecordOutcome::Recorded {
                received: state.received.len(),
                expected: state.expected.len(),
            }
        }
    }

    pub fn expected_count(&self) -> usize {
        self.lock().expected.len()
    }

    pub fn received_count(&self) -> usize {
        self.lock().received.len()
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    /// 尚未到达终态的增强作业
    pub fn outstanding(&self) -> Vec<JobId> {
        let state = self.lock();
        let mut pending: Vec<JobId> = state
            .expected
            .keys()
            .filter(|id| !state.received.contains(*id))
            .cloned()
            .collect();
        pending.sort();
        pending
    }

    /// 取出合并所需的数据；仅在释放后可用
    pub fn take_results(&self) -> Option<(Arc<ParseResult>, HashMap<String, EnrichmentResult>)> {
        let mut state = self.lock();
        if !state.released {
            return None;
        }
        let parse = state.parse_result.clone()?;
        Some((parse, std::mem::take(&mut state.results)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn expected(n: usize) -> Vec<(JobId, String)> {
        (0..n)
            .map(|i| (JobId::from(format!("job-{i}")), format!("img-{i}.jpg")))
            .collect()
    }

    #[test]
    fn test_joins_only_when_all_received_and_parse_attached() {
        let barrier = JoinBarrier::new(JobId::from("req"), expected(2));
        assert_eq!(barrier.parent_id(), &JobId::from("req"));
        assert!(!barrier.attach_parse_result(Arc::new(ParseResult::default())));

        let first = barrier.record(&JobId::from("job-0"), EnrichmentResult::success("img-0.jpg", "a"));
        assert_eq!(first, RecordOutcome::Recorded { received: 1, expected: 2 });
        assert!(barrier.take_results().is_none());

        let second = barrier.record(&JobId::from("job-1"), EnrichmentResult::failure("img-1.jpg", "x"));
        assert_eq!(second, RecordOutcome::Joined);

        let (_, results) = barrier.take_results().unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_waits_for_parse_result() {
        let barrier = JoinBarrier::new(JobId::from("req"), expected(1));
        let outcome = barrier.record(&JobId::from("job-0"), EnrichmentResult::success("img-0.jpg", "a"));
        assert_eq!(outcome, RecordOutcome::Recorded { received: 1, expected: 1 });
        assert!(!barrier.is_released());
        assert!(barrier.attach_parse_result(Arc::new(ParseResult::default())));
    }

    #[test]
    fn test_empty_barrier_releases_on_parse() {
        let barrier = JoinBarrier::new(JobId::from("req"), Vec::new());
        assert!(barrier.attach_parse_result(Arc::new(ParseResult::default())));
        assert!(!barrier.attach_parse_result(Arc::new(ParseResult::default())));
    }

    #[test]
    fn test_duplicates_and_strangers_are_not_counted() {
        let barrier = JoinBarrier::new(JobId::from("req"), expected(2));
        barrier.attach_parse_result(Arc::new(ParseResult::default()));

        barrier.record(&JobId::from("job-0"), EnrichmentResult::success("img-0.jpg", "a"));
        assert_eq!(
            barrier.record(&JobId::from("job-0"), EnrichmentResult::success("img-0.jpg", "b")),
            RecordOutcome::Duplicate
        );
        assert_eq!(
            barrier.record(&JobId::from("other"), EnrichmentResult::success("x.jpg", "c")),
            RecordOutcome::Unexpected
        );
        assert_eq!(barrier.received_count(), 1);
        assert_eq!(barrier.outstanding(), vec![JobId::from("job-1")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_release_exactly_once() {
        let n = 200;
        let barrier = Arc::new(JoinBarrier::new(JobId::from("req"), expected(n)));
        barrier.attach_parse_result(Arc::new(ParseResult::default()));
        let joined = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..n {
            for _ in 0..2 {
                let barrier = barrier.clone();
                let joined = joined.clone();
                tasks.push(tokio::spawn(async move {
                    let outcome = barrier.record(
                        &JobId::from(format!("job-{i}")),
                        EnrichmentResult::success(format!("img-{i}.jpg"), "d"),
                    );
                    if outcome == RecordOutcome::Joined {
                        joined.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
        }
        futures::future::join_all(tasks).await;

        assert_eq!(joined.load(Ordering::SeqCst), 1);
        assert_eq!(barrier.received_count(), n);
        assert!(barrier.outstanding().is_empty());
    }
}

//! 两阶段编排器 - 编排层
//!
//! ## 职责
//!
//! 把一个文档请求驱动完整个状态机：
//!
//! ```text
//! INIT → PARSING → FANNED_OUT → JOINING → MERGING → DONE
//!                (任意状态) → FAILED
//! ```
//!
//! ## 核心功能
//!
//! 1. **解析**：向调度器提交一个解析作业，校验错误同步返回
//! 2. **扇出**：为每张需要增强的图片入队一个增强作业（加急请求走加急通道）
//! 3. **汇合**：所有增强作业到达终态后才合并，事件丢失时轮询补齐
//! 4. **合并**：调用合并器并保存最终结果
//! 5. **查询**：`poll` 返回请求状态以及所有子作业的状态
//!
//! ## 设计特点
//!
//! - 解析失败时不产生任何增强作业，直接得到 FAILURE 结果
//! - 扇出之后取消不会撤回增强作业，只放弃汇合
//! - 请求记录在终态后保留 `result_ttl`，过期后查询返回 `NotFound`

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::infrastructure::work_queue::{JobStatus, Lane, NewJob, TerminalEvent, WorkQueue};
use crate::models::{
    AggregateResult, AggregateStatus, DocumentRequest, EnrichmentResult, JobId, JobKind, JobState, ParseJob, Priority,
};
use crate::scheduler::{JobHandle, SchedulerState};
use crate::workflow::{
    merge, merge_or_fail, plan_enrichment, AllFailedPolicy, ImageFilter, JoinBarrier, MergeOptions, RecordOutcome,
};

/// 编排器配置
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub normal_lane: Lane,
    pub urgent_lane: Lane,
    /// 汇合等待上限
    pub join_timeout: Duration,
    /// 事件丢失时的补偿轮询间隔
    pub poll_interval: Duration,
    /// 终态请求记录的保留时长
    pub result_ttl: Duration,
    pub image_filter: ImageFilter,
    pub all_failed_policy: AllFailedPolicy,
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            normal_lane: Lane::new(&config.enrich_queue),
            urgent_lane: Lane::new(&config.enrich_urgent_queue),
            join_timeout: config.join_timeout(),
            poll_interval: config.join_poll_interval(),
            result_ttl: config.result_ttl(),
            image_filter: config.image_filter,
            all_failed_policy: config.all_failed_policy,
        }
    }
}

/// 编排状态机的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Init,
    Parsing,
    FannedOut,
    Joining,
    Merging,
    Done,
    Failed,
}

/// 对外暴露的请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Pending,
    Running,
    Success,
    Partial,
    Failure,
}

/// 请求下的一个子作业
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRef {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
}

/// `poll` 的返回值
#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    pub request_id: JobId,
    pub state: RequestState,
    pub stage: StageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AggregateResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
    pub jobs: Vec<JobRef>,
}

struct RequestRecord {
    stage: StageState,
    parse_job: JobId,
    parse_state: JobState,
    enrich_jobs: Vec<(JobId, JobState)>,
    merge_job: Option<(JobId, JobState)>,
    cancel: watch::Sender<bool>,
    outcome: watch::Sender<Option<AggregateResult>>,
    finished_at: Option<Instant>,
}

impl RequestRecord {
    fn result(&self) -> Option<AggregateResult> {
        self.outcome.borrow().clone()
    }

    fn set_enrich_state(&mut self, job_id: &JobId, state: JobState) {
        if let Some(entry) = self.enrich_jobs.iter_mut().find(|(id, _)| id == job_id) {
            entry.1 = state;
        }
    }
}

struct Inner {
    scheduler: Arc<SchedulerState>,
    queue: Arc<dyn WorkQueue>,
    config: OrchestratorConfig,
    records: Mutex<HashMap<JobId, RequestRecord>>,
}

/// 两阶段编排器
#[derive(Clone)]
pub struct StageOrchestrator {
    inner: Arc<Inner>,
}

impl StageOrchestrator {
    pub fn new(scheduler: Arc<SchedulerState>, queue: Arc<dyn WorkQueue>, config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler,
                queue,
                config,
                records: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 提交文档请求
    ///
    /// # 返回
    /// 返回请求 ID；参数错误在任何作业创建之前同步返回
    pub fn submit(&self, request: DocumentRequest) -> PipelineResult<JobId> {
        let mut parse_job = ParseJob::new(request.input_ref.clone())
            .with_slot(request.required_slot.clone())
            .with_priority(request.priority);
        if let Some(timeout) = request.timeout_seconds {
            parse_job = parse_job.with_timeout(timeout);
        }
        if let Some(backend) = request.backend {
            parse_job = parse_job.with_backend(backend);
        }

        let handle = self.inner.scheduler.submit(parse_job)?;
        let request_id = JobId::generate();
        let (cancel, cancel_rx) = watch::channel(false);
        let (outcome, _) = watch::channel(None);

        {
            let mut records = self.inner.lock();
            self.inner.purge_expired(&mut records);
            records.insert(
                request_id.clone(),
                RequestRecord {
                    stage: StageState::Parsing,
                    parse_job: handle.job_id().clone(),
                    parse_state: JobState::Pending,
                    enrich_jobs: Vec::new(),
                    merge_job: None,
                    cancel,
                    outcome,
                    finished_at: None,
                },
            );
        }

        info!("[请求 {}] 📥 已提交，解析作业 {}", request_id, handle.job_id());
        let inner = Arc::clone(&self.inner);
        let id = request_id.clone();
        tokio::spawn(async move {
            let aggregate = inner.run_stages(&id, &request, handle, cancel_rx).await;
            inner.finish(&id, aggregate);
        });

        Ok(request_id)
    }

    /// 查询请求状态
    pub async fn poll(&self, request_id: &JobId) -> PipelineResult<RequestView> {
        let (mut view, parse_job, live_enrich) = {
            let mut records = self.inner.lock();
            self.inner.purge_expired(&mut records);
            let record = records
                .get(request_id)
                .ok_or_else(|| PipelineError::not_found(request_id))?;

            let result = record.result();
            let mut jobs = vec![JobRef {
                id: record.parse_job.clone(),
                kind: JobKind::Parse,
                state: record.parse_state,
            }];
            jobs.extend(record.enrich_jobs.iter().map(|(id, state)| JobRef {
                id: id.clone(),
                kind: JobKind::Enrich,
                state: *state,
            }));
            if let Some((id, state)) = &record.merge_job {
                jobs.push(JobRef {
                    id: id.clone(),
                    kind: JobKind::Merge,
                    state: *state,
                });
            }
            let live_enrich: Vec<JobId> = record
                .enrich_jobs
                .iter()
                .filter(|(_, state)| !state.is_terminal())
                .map(|(id, _)| id.clone())
                .collect();

            let view = RequestView {
                request_id: request_id.clone(),
                state: RequestState::Pending,
                stage: record.stage,
                error: result.as_ref().and_then(|r| r.error.clone()),
                result,
                jobs,
            };
            (view, record.parse_job.clone(), live_enrich)
        };

        // 非终态子作业以调度器和队列的实时状态为准
        if let Some(parse) = view.jobs.iter_mut().find(|job| job.id == parse_job) {
            if !parse.state.is_terminal() {
                if let Ok(snapshot) = self.inner.scheduler.get_state(&parse_job) {
                    parse.state = snapshot.state;
                }
            }
        }
        for job_id in live_enrich {
            if let Ok(status) = self.inner.queue.get_state(&job_id).await {
                if let Some(job) = view.jobs.iter_mut().find(|job| job.id == job_id) {
                    job.state = status.state();
                }
            }
        }

        view.state = match (&view.result, view.stage) {
            (Some(result), _) => match result.status {
                AggregateStatus::Success => RequestState::Success,
                AggregateStatus::Partial => RequestState::Partial,
                AggregateStatus::Failure => RequestState::Failure,
            },
            (None, StageState::Init) => RequestState::Pending,
            (None, StageState::Parsing) if view.jobs.first().map(|j| j.state) == Some(JobState::Pending) => {
                RequestState::Pending
            }
            (None, _) => RequestState::Running,
        };
        Ok(view)
    }

    /// 等待请求进入终态
    pub async fn wait(&self, request_id: &JobId) -> PipelineResult<AggregateResult> {
        let mut rx = {
            let mut records = self.inner.lock();
            self.inner.purge_expired(&mut records);
            records
                .get(request_id)
                .ok_or_else(|| PipelineError::not_found(request_id))?
                .outcome
                .subscribe()
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone())
            .map_err(|_| PipelineError::not_found(request_id))?;
        outcome.ok_or_else(|| PipelineError::not_found(request_id))
    }

    /// 取消请求
    ///
    /// 解析完成前取消会终止解析作业；扇出后只放弃汇合。
    /// 请求已结束时返回 `false`。
    pub async fn cancel(&self, request_id: &JobId) -> PipelineResult<bool> {
        let parse_job = {
            let records = self.inner.lock();
            let record = records
                .get(request_id)
                .ok_or_else(|| PipelineError::not_found(request_id))?;
            if record.finished_at.is_some() {
                return Ok(false);
            }
            record.cancel.send_replace(true);
            matches!(record.stage, StageState::Init | StageState::Parsing).then(|| record.parse_job.clone())
        };

        info!("[请求 {}] 🚫 收到取消请求", request_id);
        if let Some(parse_job) = parse_job {
            if let Err(e) = self.inner.scheduler.cancel(&parse_job).await {
                debug!("[请求 {}] 取消解析作业 {} 失败: {}", request_id, parse_job, e);
            }
        }
        Ok(true)
    }
}

impl Inner {
    // 记录只做单调更新，中毒后继续使用内部数据
    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, RequestRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_expired(&self, records: &mut HashMap<JobId, RequestRecord>) {
        let ttl = self.config.result_ttl;
        let now = Instant::now();
        records.retain(|_, record| match record.finished_at {
            Some(finished_at) => now.duration_since(finished_at) < ttl,
            None => true,
        });
    }

    fn update(&self, request_id: &JobId, f: impl FnOnce(&mut RequestRecord)) {
        if let Some(record) = self.lock().get_mut(request_id) {
            f(record);
        }
    }

    fn set_stage(&self, request_id: &JobId, stage: StageState) {
        self.update(request_id, |record| record.stage = stage);
        debug!("[请求 {}] 进入阶段 {:?}", request_id, stage);
    }

    fn merge_options(&self, request: &DocumentRequest) -> MergeOptions {
        MergeOptions {
            preserve_structure: request.preserve_structure,
            return_text: request.return_text,
            all_failed_policy: self.config.all_failed_policy,
        }
    }

    /// 驱动一个请求直到得到最终结果
    async fn run_stages(
        &self,
        request_id: &JobId,
        request: &DocumentRequest,
        handle: JobHandle,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> AggregateResult {
        let options = self.merge_options(request);

        // ========== 解析 ==========
        let parse_outcome = handle.wait().await;
        let parse_state = if parse_outcome.is_ok() {
            JobState::Success
        } else {
            JobState::Failure
        };
        self.update(request_id, |record| record.parse_state = parse_state);

        if *cancel_rx.borrow() {
            return AggregateResult::failed(PipelineError::Cancelled);
        }

        let parse = match parse_outcome {
            Ok(parse) => {
                info!(
                    "[请求 {}] 📑 解析完成: {} 个元素, {} 张图片",
                    request_id,
                    parse.elements.len(),
                    parse.image_count()
                );
                parse
            }
            Err(e) => {
                warn!("[请求 {}] ❌ 解析失败: {}", request_id, e);
                return self.run_merge(request_id, || {
                    merge_or_fail(Err(e), &HashMap::new(), &HashSet::new(), options)
                });
            }
        };

        // ========== 扇出 ==========
        let plan = plan_enrichment(&parse, &self.config.image_filter, &request.vision);
        if !plan.skipped.is_empty() {
            debug!("[请求 {}] 过滤掉 {} 张图片", request_id, plan.skipped.len());
        }
        let requested = plan.requested();
        if plan.is_empty() {
            info!("[请求 {}] 无需增强的图片，直接合并", request_id);
            return self.run_merge(request_id, || merge(&parse, &HashMap::new(), &requested, options));
        }

        // 先订阅再入队，避免漏掉早到的终态通知
        let mut events = self.queue.subscribe();
        let lane = match request.priority {
            Priority::Urgent => &self.config.urgent_lane,
            Priority::Normal => &self.config.normal_lane,
        };

        let mut expected: Vec<(JobId, String)> = Vec::with_capacity(plan.jobs.len());
        let mut enqueue_failures = Vec::new();
        for job in &plan.jobs {
            let enqueued = match serde_json::to_value(job) {
                Ok(payload) => {
                    self.queue
                        .enqueue(
                            lane,
                            NewJob {
                                kind: JobKind::Enrich,
                                payload,
                                parent_id: Some(request_id.clone()),
                            },
                        )
                        .await
                }
                Err(e) => Err(PipelineError::backend(Stage::Enrich, format!("序列化增强作业失败: {}", e))),
            };
            match enqueued {
                Ok(job_id) => expected.push((job_id, job.image_ref.clone())),
                Err(e) => {
                    warn!("[请求 {}] ⚠️ 图片 {} 入队失败: {}", request_id, job.image_ref, e);
                    let job_id = JobId::generate();
                    expected.push((job_id.clone(), job.image_ref.clone()));
                    enqueue_failures.push((job_id, EnrichmentResult::failure(job.image_ref.clone(), e.to_string())));
                }
            }
        }

        let image_refs: HashMap<JobId, String> = expected.iter().cloned().collect();
        let barrier = JoinBarrier::new(request_id.clone(), expected.clone());
        self.update(request_id, |record| {
            record.stage = StageState::FannedOut;
            record.enrich_jobs = expected.iter().map(|(id, _)| (id.clone(), JobState::Pending)).collect();
        });
        for (job_id, failure) in enqueue_failures {
            self.record_result(request_id, &barrier, &job_id, failure);
        }
        barrier.attach_parse_result(Arc::clone(&parse));
        info!(
            "[请求 {}] 🔀 已扇出 {} 个增强作业 (通道 {})",
            request_id,
            barrier.expected_count(),
            lane
        );

        // ========== 汇合 ==========
        self.set_stage(request_id, StageState::Joining);
        if let Err(error) = self.join(request_id, &barrier, &image_refs, &mut events, &mut cancel_rx).await {
            return AggregateResult::failed(error);
        }

        let Some((parse, results)) = barrier.take_results() else {
            return AggregateResult::failed(PipelineError::backend(Stage::Merge, "汇合屏障未释放"));
        };
        self.run_merge(request_id, || merge(&parse, &results, &requested, options))
    }

    /// 等待所有增强作业到达终态
    async fn join(
        &self,
        request_id: &JobId,
        barrier: &JoinBarrier,
        image_refs: &HashMap<JobId, String>,
        events: &mut broadcast::Receiver<TerminalEvent>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> PipelineResult<()> {
        let started = Instant::now();
        let deadline = started + self.config.join_timeout;
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        while !barrier.is_released() {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Ok(event) if event.parent_id.as_ref() == Some(request_id) => {
                        if let Some(image_ref) = image_refs.get(&event.job_id) {
                            let result = to_enrichment_result(image_ref, &event.status);
                            self.record_result(request_id, barrier, &event.job_id, result);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[请求 {}] ⚠️ 丢失 {} 条终态通知，开始对账", request_id, skipped);
                        self.reconcile(request_id, barrier, image_refs).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("[请求 {}] ⚠️ 终态通知已关闭，改为轮询", request_id);
                        events_open = false;
                    }
                },
                _ = ticker.tick() => self.reconcile(request_id, barrier, image_refs).await,
                _ = tokio::time::sleep_until(deadline) => {
                    let pending = barrier.outstanding();
                    warn!(
                        "[请求 {}] ⏰ 汇合超时，{} 个增强作业未完成",
                        request_id,
                        pending.len()
                    );
                    return Err(PipelineError::JoinTimeout {
                        waited_seconds: started.elapsed().as_secs(),
                        pending,
                    });
                }
                _ = cancelled(cancel_rx) => {
                    info!("[请求 {}] 🚫 放弃汇合", request_id);
                    return Err(PipelineError::Cancelled);
                }
            }
        }
        Ok(())
    }

    /// 逐个查询未完成作业的状态，补齐丢失的通知
    async fn reconcile(&self, request_id: &JobId, barrier: &JoinBarrier, image_refs: &HashMap<JobId, String>) {
        for job_id in barrier.outstanding() {
            let Some(image_ref) = image_refs.get(&job_id) else {
                continue;
            };
            match self.queue.get_state(&job_id).await {
                Ok(status) if status.is_terminal() => {
                    let result = to_enrichment_result(image_ref, &status);
                    self.record_result(request_id, barrier, &job_id, result);
                }
                Ok(status) => self.update(request_id, |record| record.set_enrich_state(&job_id, status.state())),
                Err(PipelineError::NotFound { .. }) => {
                    let result = EnrichmentResult::failure(image_ref.clone(), "增强作业结果已过期");
                    self.record_result(request_id, barrier, &job_id, result);
                }
                Err(e) => debug!("[请求 {}] 查询作业 {} 失败: {}", request_id, job_id, e),
            }
        }
    }

    fn record_result(&self, request_id: &JobId, barrier: &JoinBarrier, job_id: &JobId, result: EnrichmentResult) {
        let state = if result.usable_text().is_some() {
            JobState::Success
        } else {
            JobState::Failure
        };
        match barrier.record(job_id, result) {
            RecordOutcome::Recorded { received, expected } => {
                debug!("[请求 {}] 增强进度 {}/{}", request_id, received, expected);
            }
            RecordOutcome::Joined => info!("[请求 {}] ✓ 所有增强作业已完成", barrier.parent_id()),
            RecordOutcome::Duplicate | RecordOutcome::Unexpected => return,
        }
        self.update(request_id, |record| record.set_enrich_state(job_id, state));
    }

    /// 在合并作业下执行合并
    fn run_merge(&self, request_id: &JobId, merge_fn: impl FnOnce() -> AggregateResult) -> AggregateResult {
        let merge_job = JobId::generate();
        self.update(request_id, |record| {
            record.stage = StageState::Merging;
            record.merge_job = Some((merge_job.clone(), JobState::Running));
        });
        merge_fn()
    }

    /// 保存最终结果并唤醒等待者
    fn finish(&self, request_id: &JobId, aggregate: AggregateResult) {
        let status = aggregate.status;
        match status {
            AggregateStatus::Success => info!("[请求 {}] ✅ 处理完成", request_id),
            AggregateStatus::Partial => warn!(
                "[请求 {}] ⚠️ 部分完成，{} 张图片增强失败",
                request_id,
                aggregate.failures.len()
            ),
            AggregateStatus::Failure => warn!(
                "[请求 {}] ❌ 处理失败: {}",
                request_id,
                aggregate
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default()
            ),
        }

        self.update(request_id, |record| {
            record.stage = if status == AggregateStatus::Failure {
                StageState::Failed
            } else {
                StageState::Done
            };
            if let Some((_, state)) = record.merge_job.as_mut() {
                *state = if status == AggregateStatus::Failure {
                    JobState::Failure
                } else {
                    JobState::Success
                };
            }
            record.finished_at = Some(Instant::now());
            record.outcome.send_replace(Some(aggregate));
        });
    }
}

/// 把队列终态转换为增强结果
fn to_enrichment_result(image_ref: &str, status: &JobStatus) -> EnrichmentResult {
    match status {
        JobStatus::Success { result } => match serde_json::from_value::<EnrichmentResult>(result.clone()) {
            Ok(mut enrichment) => {
                enrichment.image_ref = image_ref.to_string();
                enrichment
            }
            Err(e) => EnrichmentResult::failure(image_ref, format!("无法解析增强结果: {}", e)),
        },
        JobStatus::Failure { error } => EnrichmentResult::failure(image_ref, error.to_string()),
        JobStatus::Pending | JobStatus::Running => EnrichmentResult::failure(image_ref, "增强作业尚未完成"),
    }
}

/// 等待取消信号；发送端消失时永不返回
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

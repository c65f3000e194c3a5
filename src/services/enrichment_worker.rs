//! 视觉增强工作池
//!
//! ## 职责
//!
//! - 从工作队列的加急通道和普通通道取增强作业（加急优先）
//! - 调用 `EnrichmentBackend` 描述图片，单次请求有超时
//! - 把成功描述或失败原因写回队列终态
//!
//! ## 设计特点
//!
//! - 不重试：失败直接记为终态，由合并阶段标注
//! - 对加速卡调度器一无所知，和解析阶段完全解耦

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::infrastructure::work_queue::{Lane, QueuedJob, WorkQueue};
use crate::models::{EnrichmentJob, EnrichmentResult};

/// 图片描述后端（视觉模型服务或测试替身）
#[async_trait]
pub trait EnrichmentBackend: Send + Sync {
    /// 返回图片描述文本
    async fn enrich(&self, job: &EnrichmentJob) -> PipelineResult<String>;
}

/// 增强工作池
pub struct EnrichmentWorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl EnrichmentWorkerPool {
    /// 启动工作池
    ///
    /// # 参数
    /// - `lanes`: 监听的通道，按优先级从高到低排列
    /// - `workers`: 并发消费者数量
    /// - `request_timeout`: 单张图片的请求超时
    pub fn spawn(
        queue: Arc<dyn WorkQueue>,
        backend: Arc<dyn EnrichmentBackend>,
        lanes: Vec<Lane>,
        workers: usize,
        request_timeout: Duration,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let lanes = Arc::new(lanes);

        let workers = (0..workers.max(1))
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let backend = Arc::clone(&backend);
                let lanes = Arc::clone(&lanes);
                let mut shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => break,
                            job = queue.dequeue(&lanes) => job,
                        };
                        match job {
                            Ok(job) => {
                                process_one(queue.as_ref(), backend.as_ref(), &job, request_timeout, worker_id).await
                            }
                            Err(e) => {
                                warn!("[增强 {}] 取作业失败: {}", worker_id, e);
                                break;
                            }
                        }
                    }
                    debug!("[增强 {}] 已退出", worker_id);
                })
            })
            .collect();

        Self { shutdown, workers }
    }

    /// 停止所有消费者，正在处理的作业会先完成
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for joined in futures::future::join_all(self.workers).await {
            if let Err(e) = joined {
                warn!("⚠️ 增强 worker 异常退出: {}", e);
            }
        }
        info!("🛑 增强工作池已停止");
    }
}

/// 处理一个增强作业并写回终态
async fn process_one(
    queue: &dyn WorkQueue,
    backend: &dyn EnrichmentBackend,
    job: &QueuedJob,
    request_timeout: Duration,
    worker_id: usize,
) {
    let outcome = run_enrichment(backend, job, request_timeout).await;
    match &outcome {
        Ok(_) => debug!("[增强 {}] ✓ 作业 {} 完成", worker_id, job.id),
        Err(e) => warn!("[增强 {}] ✗ 作业 {} 失败: {}", worker_id, job.id, e),
    }
    if let Err(e) = queue.complete(&job.id, outcome).await {
        warn!("[增强 {}] 写回作业 {} 终态失败: {}", worker_id, job.id, e);
    }
}

async fn run_enrichment(
    backend: &dyn EnrichmentBackend,
    job: &QueuedJob,
    request_timeout: Duration,
) -> PipelineResult<serde_json::Value> {
    let payload: EnrichmentJob = serde_json::from_value(job.payload.clone())
        .map_err(|e| PipelineError::backend(Stage::Enrich, format!("无效的增强作业负载: {}", e)))?;

    let text = tokio::time::timeout(request_timeout, backend.enrich(&payload))
        .await
        .map_err(|_| {
            PipelineError::backend(
                Stage::Enrich,
                format!("视觉模型请求超时 ({}s)", request_timeout.as_secs()),
            )
        })??;

    serde_json::to_value(EnrichmentResult::success(payload.image_ref, text))
        .map_err(|e| PipelineError::backend(Stage::Enrich, format!("序列化增强结果失败: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::work_queue::{InMemoryWorkQueue, JobStatus, NewJob};
    use crate::models::{JobKind, VisionOptions};
    use serde_json::json;
    use std::sync::Mutex;

    /// 按图片路径决定行为的测试后端
    struct FakeBackend {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EnrichmentBackend for FakeBackend {
        async fn enrich(&self, job: &EnrichmentJob) -> PipelineResult<String> {
            self.calls.lock().unwrap().push(job.image_ref.clone());
            match job.image_ref.as_str() {
                "slow.jpg" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok("too late".to_string())
                }
                "bad.jpg" => Err(PipelineError::backend(Stage::Enrich, "model refused")),
                other => Ok(format!("desc of {}", other)),
            }
        }
    }

    fn enrich_job(image_ref: &str) -> NewJob {
        let payload = EnrichmentJob {
            image_ref: image_ref.to_string(),
            context: String::new(),
            base_text: String::new(),
            page_number: 1,
            options: VisionOptions::default(),
        };
        NewJob {
            kind: JobKind::Enrich,
            payload: serde_json::to_value(payload).unwrap(),
            parent_id: None,
        }
    }

    async fn wait_terminal(queue: &InMemoryWorkQueue, id: &crate::models::JobId) -> JobStatus {
        loop {
            let status = queue.get_state(id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn setup(workers: usize, timeout: Duration) -> (Arc<InMemoryWorkQueue>, Arc<FakeBackend>, EnrichmentWorkerPool) {
        let queue = Arc::new(InMemoryWorkQueue::new(Duration::from_secs(600)));
        let backend = Arc::new(FakeBackend {
            calls: Mutex::new(Vec::new()),
        });
        let pool = EnrichmentWorkerPool::spawn(
            queue.clone(),
            backend.clone(),
            vec![Lane::new("urgent"), Lane::new("normal")],
            workers,
            timeout,
        );
        (queue, backend, pool)
    }

    #[tokio::test]
    async fn test_success_and_failure_are_recorded() {
        let (queue, _backend, pool) = setup(2, Duration::from_secs(5));
        let lane = Lane::new("normal");
        let ok = queue.enqueue(&lane, enrich_job("fig1.jpg")).await.unwrap();
        let bad = queue.enqueue(&lane, enrich_job("bad.jpg")).await.unwrap();

        match wait_terminal(&queue, &ok).await {
            JobStatus::Success { result } => {
                let result: EnrichmentResult = serde_json::from_value(result).unwrap();
                assert_eq!(result.text.as_deref(), Some("desc of fig1.jpg"));
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert!(matches!(
            wait_terminal(&queue, &bad).await,
            JobStatus::Failure {
                error: PipelineError::BackendFailure { stage: Stage::Enrich, .. }
            }
        ));
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_becomes_failure() {
        let (queue, _backend, pool) = setup(1, Duration::from_secs(2));
        let id = queue.enqueue(&Lane::new("normal"), enrich_job("slow.jpg")).await.unwrap();

        match wait_terminal(&queue, &id).await {
            JobStatus::Failure { error } => assert!(error.to_string().contains("超时")),
            other => panic!("unexpected status {:?}", other),
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_payload_is_failure() {
        let (queue, backend, pool) = setup(1, Duration::from_secs(5));
        let id = queue
            .enqueue(
                &Lane::new("normal"),
                NewJob {
                    kind: JobKind::Enrich,
                    payload: json!({ "unexpected": true }),
                    parent_id: None,
                },
            )
            .await
            .unwrap();

        assert!(matches!(wait_terminal(&queue, &id).await, JobStatus::Failure { .. }));
        assert!(backend.calls.lock().unwrap().is_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_urgent_lane_drains_first() {
        let queue = Arc::new(InMemoryWorkQueue::new(Duration::from_secs(600)));
        let backend = Arc::new(FakeBackend {
            calls: Mutex::new(Vec::new()),
        });
        let normal = queue.enqueue(&Lane::new("normal"), enrich_job("n.jpg")).await.unwrap();
        let urgent = queue.enqueue(&Lane::new("urgent"), enrich_job("u.jpg")).await.unwrap();

        let pool = EnrichmentWorkerPool::spawn(
            queue.clone(),
            backend.clone(),
            vec![Lane::new("urgent"), Lane::new("normal")],
            1,
            Duration::from_secs(5),
        );
        wait_terminal(&queue, &urgent).await;
        wait_terminal(&queue, &normal).await;
        assert_eq!(*backend.calls.lock().unwrap(), vec!["u.jpg", "n.jpg"]);
        pool.shutdown().await;
    }
}

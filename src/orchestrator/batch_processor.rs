//! 批量请求处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责批量文档请求的处理和资源管理。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：启动调度器、工作队列、视觉模型服务和增强工作池
//! 2. **批量加载**：扫描并加载所有请求清单（`Vec<DocumentRequest>`）
//! 3. **并发控制**：使用 Semaphore 限制同时在途的请求数量
//! 4. **分批处理**：将请求分批次提交，每批完成后再开始下一批
//! 5. **结果落盘**：每个请求写出 `<name>.json`，需要时再写 `<name>.txt`；重名时追加请求序号
//! 6. **全局统计**：汇总成功 / 部分成功 / 失败数量，最后有序关闭所有资源
//!
//! ## 设计特点
//!
//! - **顶层编排**：不处理单个请求的阶段细节，全部委托给 `StageOrchestrator`
//! - **资源所有者**：唯一持有调度器和增强工作池的模块

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::infrastructure::{InMemoryWorkQueue, Lane, ProcessWorker, WorkQueue};
use crate::models::{AggregateResult, AggregateStatus, DocumentRequest};
use crate::orchestrator::stage_orchestrator::{OrchestratorConfig, StageOrchestrator};
use crate::scheduler::{SchedulerConfig, SchedulerState};
use crate::services::{EnrichmentWorkerPool, VisionService};
use crate::utils::logging::{
    log_batch_complete, log_batch_start, log_requests_loaded, log_startup, print_final_stats,
};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// 应用主结构
pub struct App {
    config: Config,
    scheduler: Arc<SchedulerState>,
    queue: Arc<InMemoryWorkQueue>,
    workers: EnrichmentWorkerPool,
    orchestrator: StageOrchestrator,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        log_startup(&config);

        tokio::fs::create_dir_all(&config.output_folder)
            .await
            .map_err(|e| AppError::file(&config.output_folder, e))?;

        let worker = ProcessWorker::new(
            config.parse_worker_program.clone(),
            config.parse_worker_args.clone(),
            config.task_storage_dir.clone(),
        );
        let scheduler = Arc::new(SchedulerState::start(SchedulerConfig::from_config(&config), worker)?);

        let queue = Arc::new(InMemoryWorkQueue::new(config.result_ttl()));
        let vision = Arc::new(VisionService::new(&config)?);
        let workers = EnrichmentWorkerPool::spawn(
            queue.clone(),
            vision,
            vec![Lane::new(&config.enrich_urgent_queue), Lane::new(&config.enrich_queue)],
            config.enrich_workers,
            config.vision_request_timeout(),
        );

        let orchestrator = StageOrchestrator::new(
            scheduler.clone(),
            queue.clone() as Arc<dyn WorkQueue>,
            OrchestratorConfig::from_config(&config),
        );

        Ok(Self {
            config,
            scheduler,
            queue,
            workers,
            orchestrator,
        })
    }

    /// 运行应用主逻辑
    pub async fn run(self) -> Result<()> {
        let outcome = self.process_all().await;

        // 无论成功与否都要关闭资源
        self.workers.shutdown().await;
        self.scheduler.shutdown().await;
        outcome
    }

    async fn process_all(&self) -> Result<()> {
        info!("\n📁 正在扫描待处理的请求清单...");
        let all_requests = crate::models::load_all_manifests(&self.config.request_folder).await?;

        if all_requests.is_empty() {
            warn!("⚠️ 没有找到待处理的请求，程序结束");
            return Ok(());
        }

        let max_concurrent = self.config.max_concurrent_requests;
        log_requests_loaded(all_requests.len(), max_concurrent);

        let stats = self.process_all_requests(all_requests).await?;

        print_final_stats(
            stats.success,
            stats.partial,
            stats.failed,
            stats.total,
            &self.config.output_folder,
        );
        match self.queue.stats() {
            Ok(queue_stats) => info!(
                "📮 增强队列: 共入队 {}，已完成 {}，排队 {}，运行中 {}",
                queue_stats.total_enqueued, queue_stats.finished, queue_stats.pending, queue_stats.running
            ),
            Err(e) => warn!("⚠️ 无法读取队列统计: {}", e),
        }
        Ok(())
    }

    /// 处理所有请求
    async fn process_all_requests(&self, all_requests: Vec<DocumentRequest>) -> Result<ProcessingStats> {
        let max_concurrent = self.config.max_concurrent_requests;
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let total = all_requests.len();
        let stems = unique_output_stems(&all_requests);
        let mut stats = ProcessingStats {
            total,
            ..Default::default()
        };

        // 分批处理
        let total_batches = total.div_ceil(max_concurrent);
        for (batch_idx, batch) in all_requests.chunks(max_concurrent).enumerate() {
            let batch_start = batch_idx * max_concurrent;
            let batch_num = batch_idx + 1;
            log_batch_start(batch_num, total_batches, batch_start + 1, batch_start + batch.len(), total);

            let batch_stems = &stems[batch_start..batch_start + batch.len()];
            let batch_result = self.process_batch(batch, batch_stems, batch_start, semaphore.clone()).await?;

            stats.success += batch_result.success;
            stats.partial += batch_result.partial;
            stats.failed += batch_result.failed;

            log_batch_complete(
                batch_num,
                batch_result.success,
                batch_result.partial,
                batch_result.success + batch_result.partial + batch_result.failed,
            );
        }

        Ok(stats)
    }

    /// 处理单个批次
    async fn process_batch(
        &self,
        batch: &[DocumentRequest],
        stems: &[String],
        batch_start: usize,
        semaphore: Arc<Semaphore>,
    ) -> Result<BatchResult> {
        let mut batch_handles = Vec::new();

        for (idx, (request, stem)) in batch.iter().zip(stems).enumerate() {
            let request_index = batch_start + idx + 1;
            let permit = semaphore.clone().acquire_owned().await?;
            let orchestrator = self.orchestrator.clone();
            let output_folder = PathBuf::from(&self.config.output_folder);
            let request = request.clone();
            let stem = stem.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                process_request(&orchestrator, request, &stem, request_index, &output_folder).await
            });
            batch_handles.push((request_index, handle));
        }

        let mut result = BatchResult::default();
        for (request_index, handle) in batch_handles {
            match handle.await {
                Ok(Ok(AggregateStatus::Success)) => result.success += 1,
                Ok(Ok(AggregateStatus::Partial)) => result.partial += 1,
                Ok(Ok(AggregateStatus::Failure)) => result.failed += 1,
                Ok(Err(e)) => {
                    error!("[请求 #{}] ❌ 处理过程中发生错误: {}", request_index, e);
                    result.failed += 1;
                }
                Err(e) => {
                    error!("[请求 #{}] 任务执行失败: {}", request_index, e);
                    result.failed += 1;
                }
            }
        }

        Ok(result)
    }
}

/// 提交单个请求、等待结果并写出文件
async fn process_request(
    orchestrator: &StageOrchestrator,
    request: DocumentRequest,
    stem: &str,
    request_index: usize,
    output_folder: &Path,
) -> AppResult<AggregateStatus> {
    info!("[请求 #{}] 📄 {} ({})", request_index, stem, request.input_ref);

    let aggregate = match orchestrator.submit(request) {
        Ok(request_id) => orchestrator.wait(&request_id).await?,
        // 校验失败也要落盘，方便排查
        Err(e) => AggregateResult::failed(e),
    };

    write_result(output_folder, stem, &aggregate).await?;
    info!(
        "[请求 #{}] 💾 {} 已写出 ({} 个元素)",
        request_index,
        stem,
        aggregate.elements.len()
    );
    Ok(aggregate.status)
}

/// 为整批请求分配互不冲突的输出文件名
///
/// 主干重复时追加请求序号（从 1 开始），如 `report_2`。
fn unique_output_stems(requests: &[DocumentRequest]) -> Vec<String> {
    let stems: Vec<String> = requests.iter().map(DocumentRequest::output_stem).collect();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for stem in &stems {
        *counts.entry(stem.as_str()).or_default() += 1;
    }

    let mut taken: HashSet<String> = stems
        .iter()
        .filter(|stem| counts[stem.as_str()] == 1)
        .cloned()
        .collect();
    let mut unique = Vec::with_capacity(stems.len());
    for (idx, stem) in stems.iter().enumerate() {
        if counts[stem.as_str()] == 1 {
            unique.push(stem.clone());
            continue;
        }
        let suffixed = format!("{}_{}", stem, idx + 1);
        let mut candidate = suffixed.clone();
        while !taken.insert(candidate.clone()) {
            candidate.push('_');
        }
        if candidate != suffixed {
            warn!("⚠️ 输出文件名 {} 已被占用，改用 {}", suffixed, candidate);
        }
        unique.push(candidate);
    }
    unique
}

async fn write_result(output_folder: &Path, stem: &str, aggregate: &AggregateResult) -> AppResult<()> {
    let json_path = output_folder.join(format!("{}.json", stem));
    let json = serde_json::to_string_pretty(aggregate)?;
    tokio::fs::write(&json_path, json)
        .await
        .map_err(|e| AppError::file(json_path.display().to_string(), e))?;

    if let Some(text) = &aggregate.text {
        let text_path = output_folder.join(format!("{}.txt", stem));
        tokio::fs::write(&text_path, text)
            .await
            .map_err(|e| AppError::file(text_path.display().to_string(), e))?;
    }
    Ok(())
}

/// 处理统计
#[derive(Debug, Default)]
struct ProcessingStats {
    success: usize,
    partial: usize,
    failed: usize,
    total: usize,
}

/// 批次处理结果
#[derive(Debug, Default)]
struct BatchResult {
    success: usize,
    partial: usize,
    failed: usize,
}

//! 进程隔离的解析 worker
//!
//! 每个解析作业在独立的子进程中运行：
//!
//! - 子进程位于独立进程组，作业结束时（含正常退出）整组强制终止
//! - 通过 `CUDA_VISIBLE_DEVICES` 绑定到槽位对应的加速卡
//! - 每个作业拥有独立临时目录，任何结束路径都会回收
//! - 作业请求以 JSON 写入 stdin，成功时 stdout 输出 `ParseResult` JSON

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::models::{ParseBackend, ParseJob, ParseResult, SlotId};
use crate::utils::logging::tail_text;

/// 子进程退出后等待输出管道关闭的最长时间
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(5);
/// 错误信息中保留的 stderr 尾部长度
const STDERR_TAIL_CHARS: usize = 2000;

/// 写入 worker stdin 的作业请求
#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    job_id: &'a str,
    input_ref: &'a str,
    backend: &'a str,
    slot_id: &'a str,
    workdir: &'a Path,
}

/// 子进程的结束方式
enum Exit {
    Finished(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// 解析 worker 启动器
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    program: String,
    args: Vec<String>,
    storage_dir: PathBuf,
}

impl ProcessWorker {
    pub fn new(program: impl Into<String>, args: Vec<String>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            storage_dir: storage_dir.into(),
        }
    }

    /// 在隔离进程中执行一个解析作业
    ///
    /// # 参数
    /// - `job`: 解析作业
    /// - `slot`: 执行槽位
    /// - `backend`: 已解析回退后的解析后端
    /// - `timeout`: 硬超时
    /// - `cancel`: 取消信号，发送端被丢弃不视为取消
    ///
    /// # 返回
    /// 成功返回解析结果；失败返回 `ResourceTimeout` / `Cancelled` / `BackendFailure`
    pub async fn run(
        &self,
        job: &ParseJob,
        slot: &SlotId,
        backend: ParseBackend,
        timeout: Duration,
        cancel: oneshot::Receiver<()>,
    ) -> PipelineResult<ParseResult> {
        tokio::fs::create_dir_all(&self.storage_dir).await.map_err(|e| {
            PipelineError::backend(
                Stage::Parse,
                format!("无法创建作业目录 {}: {}", self.storage_dir.display(), e),
            )
        })?;

        let workdir = tempfile::Builder::new()
            .prefix(&format!("parse-{}-", job.id))
            .tempdir_in(&self.storage_dir)
            .map_err(|e| PipelineError::backend(Stage::Parse, format!("无法创建作业临时目录: {}", e)))?;

        let result = self
            .run_in_workdir(job, slot, backend, timeout, cancel, workdir.path())
            .await;

        let workdir_path = workdir.path().to_path_buf();
        if let Err(e) = workdir.close() {
            warn!("[作业 {}] ⚠️ 临时目录回收失败 {}: {}", job.id, workdir_path.display(), e);
        }

        result
    }

    async fn run_in_workdir(
        &self,
        job: &ParseJob,
        slot: &SlotId,
        backend: ParseBackend,
        timeout: Duration,
        mut cancel: oneshot::Receiver<()>,
        workdir: &Path,
    ) -> PipelineResult<ParseResult> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(workdir)
            .env("CUDA_VISIBLE_DEVICES", slot.as_str())
            .env("PARSE_JOB_ID", job.id.as_str())
            .env("PARSE_INPUT_REF", &job.input_ref)
            .env("PARSE_BACKEND", backend.name())
            .env("PARSE_JOB_WORKDIR", workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            PipelineError::backend(Stage::Parse, format!("无法启动解析 worker '{}': {}", self.program, e))
        })?;
        let pid = child.id();
        info!(
            "[槽位 {}] ▶ 作业 {} 已启动 (pid {:?}, 后端 {})",
            slot, job.id, pid, backend
        );

        let request = serde_json::to_vec(&WorkerRequest {
            job_id: job.id.as_str(),
            input_ref: &job.input_ref,
            backend: backend.name(),
            slot_id: slot.as_str(),
            workdir,
        })
        .map_err(|e| PipelineError::backend(Stage::Parse, format!("作业请求序列化失败: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let job_id = job.id.clone();
            tokio::spawn(async move {
                // worker 不读取 stdin 时会出现 BrokenPipe
                if let Err(e) = stdin.write_all(&request).await {
                    debug!("[作业 {}] 写入 stdin 失败: {}", job_id, e);
                }
            });
        }

        let stdout_task = child.stdout.take().map(spawn_reader);
        let stderr_task = child.stderr.take().map(spawn_reader);

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status),
            _ = &mut deadline => Exit::TimedOut,
            Ok(()) = &mut cancel => Exit::Cancelled,
        };

        // 正常退出也要清理整个进程组，残留的后代进程不能占用槽位或输出管道
        kill_process_group(pid).await;
        if !matches!(exit, Exit::Finished(_)) {
            if let Err(e) = child.start_kill() {
                debug!("[作业 {}] 子进程已退出: {}", job.id, e);
            }
            if let Err(e) = child.wait().await {
                warn!("[作业 {}] ⚠️ 回收子进程失败: {}", job.id, e);
            }
        }

        let (stdout, stderr) = tokio::join!(drain(stdout_task), drain(stderr_task));

        match exit {
            Exit::TimedOut => Err(PipelineError::ResourceTimeout {
                job_id: job.id.clone(),
                timeout_seconds: timeout.as_secs(),
            }),
            Exit::Cancelled => Err(PipelineError::Cancelled),
            Exit::Finished(Err(e)) => Err(PipelineError::backend(
                Stage::Parse,
                format!("等待 worker 退出失败: {}", e),
            )),
            Exit::Finished(Ok(status)) if !status.success() => Err(PipelineError::backend(
                Stage::Parse,
                format!(
                    "worker 异常退出 ({}): {}",
                    status,
                    tail_text(&String::from_utf8_lossy(&stderr), STDERR_TAIL_CHARS)
                ),
            )),
            Exit::Finished(Ok(_)) => serde_json::from_slice::<ParseResult>(&stdout).map_err(|e| {
                PipelineError::backend(Stage::Parse, format!("worker 输出无法解析为解析结果: {}", e))
            }),
        }
    }
}

fn spawn_reader<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!("读取 worker 输出失败: {}", e);
        }
        buf
    })
}

/// 收集输出；残留的后代进程占用管道时放弃等待
async fn drain(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut task).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(e)) => {
            warn!("⚠️ 输出读取任务异常: {}", e);
            Vec::new()
        }
        Err(_) => {
            warn!("⚠️ worker 已退出但输出管道仍被占用，放弃读取");
            task.abort();
            Vec::new()
        }
    }
}

fn sanitize_pid(pid: Option<u32>) -> Option<u32> {
    pid.filter(|p| *p != 0 && *p <= i32::MAX as u32)
}

#[cfg(unix)]
async fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = sanitize_pid(pid) else {
        warn!("⚠️ 无效的 pid {:?}，跳过进程组终止", pid);
        return;
    };
    let group = format!("-{}", pid);
    match Command::new("kill").args(["-9", "--", &group]).output().await {
        Ok(output) if !output.status.success() => {
            debug!("终止进程组 {} 失败: {}", pid, String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(_) => debug!("已终止进程组 {}", pid),
        Err(e) => warn!("⚠️ 无法执行 kill: {}", e),
    }
}

#[cfg(not(unix))]
async fn kill_process_group(pid: Option<u32>) {
    let _ = sanitize_pid(pid);
}

//! 调度器集成测试
//!
//! 用 `sh` 脚本充当解析 worker，脚本根据 `$PARSE_INPUT_REF` 决定行为。

#![cfg(unix)]

use gpu_parse_pipeline::models::{JobState, ParseBackend, ParseJob, SlotId, SlotSelector};
use gpu_parse_pipeline::scheduler::SlotStatus;
use gpu_parse_pipeline::{PipelineError, ProcessWorker, SchedulerConfig, SchedulerState, Stage};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// 测试 worker 脚本
///
/// - `slow*`：后台启动一个孙进程并等待，用于验证整组终止
/// - `crash*`：写 stderr 后以非零码退出
/// - 其他：短暂休眠后输出一个文本元素，内容为实际使用的后端
fn worker_script(dir: &Path) -> String {
    format!(
        r#"cat > /dev/null
LOG="{log}"
echo "start $PARSE_INPUT_REF" >> "$LOG"
case "$PARSE_INPUT_REF" in
  slow*)
    sleep 30 &
    echo $! > "{dir}/$PARSE_INPUT_REF.grandchild"
    wait
    ;;
  crash*)
    echo "segmentation fault" >&2
    exit 3
    ;;
  *)
    sleep 0.2
    ;;
esac
echo "end $PARSE_INPUT_REF" >> "$LOG"
echo "{{\"elements\":[{{\"index\":0,\"type\":\"text\",\"text\":\"$PARSE_BACKEND\"}}]}}"
"#,
        log = dir.join("events.log").display(),
        dir = dir.display(),
    )
}

struct Fixture {
    scheduler: SchedulerState,
    dir: TempDir,
    storage: TempDir,
}

fn start(slots: &[&str], default_timeout: Duration) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    let worker = ProcessWorker::new(
        "sh",
        vec!["-c".to_string(), worker_script(dir.path())],
        storage.path(),
    );
    let config = SchedulerConfig {
        slots: slots.iter().map(|s| SlotId::new(*s)).collect(),
        default_timeout,
        default_backend: ParseBackend::Pipeline,
        result_ttl: Duration::from_secs(600),
    };
    let scheduler = SchedulerState::start(config, worker).unwrap();
    Fixture {
        scheduler,
        dir,
        storage,
    }
}

fn events(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("events.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slot_runs_jobs_fifo_without_overlap() {
    let fx = start(&["0"], Duration::from_secs(30));

    let handles: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| fx.scheduler.submit(ParseJob::new(*name)).unwrap())
        .collect();
    for handle in handles {
        handle.wait().await.unwrap();
    }

    assert_eq!(
        events(fx.dir.path()),
        vec!["start a", "end a", "start b", "end b", "start c", "end c"]
    );
    fx.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_kills_job_and_slot_moves_on() {
    let fx = start(&["0"], Duration::from_secs(30));
    let started = Instant::now();

    let slow = fx.scheduler.submit(ParseJob::new("slow-a").with_timeout(1)).unwrap();
    let next = fx.scheduler.submit(ParseJob::new("b")).unwrap();
    let slow_id = slow.job_id().clone();
    let next_id = next.job_id().clone();

    let err = slow.wait().await.unwrap_err();
    assert_eq!(
        err,
        PipelineError::ResourceTimeout {
            job_id: slow_id.clone(),
            timeout_seconds: 1
        }
    );
    let timed_out_after = started.elapsed();
    assert!(timed_out_after >= Duration::from_secs(1));
    assert!(timed_out_after < Duration::from_secs(5), "took {:?}", timed_out_after);

    next.wait().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(6));

    let slow_snapshot = fx.scheduler.get_state(&slow_id).unwrap();
    let next_snapshot = fx.scheduler.get_state(&next_id).unwrap();
    assert_eq!(slow_snapshot.state, JobState::Failure);
    assert_eq!(next_snapshot.state, JobState::Success);
    assert!(next_snapshot.started_at.unwrap() >= slow_snapshot.finished_at.unwrap());

    fx.scheduler.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_kills_whole_process_group() {
    let fx = start(&["0"], Duration::from_secs(30));

    let handle = fx.scheduler.submit(ParseJob::new("slow-group").with_timeout(1)).unwrap();
    assert!(matches!(handle.wait().await, Err(PipelineError::ResourceTimeout { .. })));

    let pid = std::fs::read_to_string(fx.dir.path().join("slow-group.grandchild")).unwrap();
    let stat_path = format!("/proc/{}/stat", pid.trim());

    // 孙进程要么已被回收，要么只剩僵尸状态
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let alive = match std::fs::read_to_string(&stat_path) {
            Ok(stat) => !stat.contains(") Z"),
            Err(_) => false,
        };
        if !alive {
            break;
        }
        assert!(Instant::now() < deadline, "grandchild {} still running", pid.trim());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    fx.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workdir_reclaimed_on_every_exit_path() {
    let fx = start(&["0"], Duration::from_secs(30));

    let ok = fx.scheduler.submit(ParseJob::new("ok")).unwrap();
    let crash = fx.scheduler.submit(ParseJob::new("crash")).unwrap();
    let slow = fx.scheduler.submit(ParseJob::new("slow-dir").with_timeout(1)).unwrap();
    ok.wait().await.unwrap();
    assert!(crash.wait().await.is_err());
    assert!(slow.wait().await.is_err());

    assert_eq!(std::fs::read_dir(fx.storage.path()).unwrap().count(), 0);
    fx.scheduler.shutdown().await;
}

/// 轮询槽位状态直到满足条件
async fn wait_for_slot(scheduler: &SchedulerState, slot: &str, check: impl Fn(&SlotStatus) -> bool) -> SlotStatus {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = scheduler.status().unwrap()[&SlotId::new(slot)].clone();
        if check(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "slot {} stuck at {:?}", slot, status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_reports_running_and_queued_jobs() {
    let fx = start(&["0"], Duration::from_secs(30));
    assert_eq!(fx.scheduler.status().unwrap()[&SlotId::new("0")], SlotStatus::default());

    let first = fx.scheduler.submit(ParseJob::new("slow-status")).unwrap();
    let first_id = first.job_id().clone();
    wait_for_slot(&fx.scheduler, "0", |s| s.running_job_id.as_ref() == Some(&first_id)).await;

    let second = fx.scheduler.submit(ParseJob::new("b")).unwrap();
    let second_id = second.job_id().clone();
    let status = fx.scheduler.status().unwrap()[&SlotId::new("0")].clone();
    assert_eq!(status.queue_depth, 1);
    assert_eq!(status.running_job_id, Some(first_id.clone()));
    assert!(status.running_since.is_some());
    assert_eq!(fx.scheduler.total_pending().unwrap(), 2);

    // 第一个作业结束后，队列前移
    assert!(fx.scheduler.cancel(&first_id).await.unwrap());
    assert_eq!(first.wait().await.unwrap_err(), PipelineError::Cancelled);
    let status = wait_for_slot(&fx.scheduler, "0", |s| s.queue_depth == 0).await;
    assert_ne!(status.running_job_id, Some(first_id.clone()));
    assert!(status.running_job_id.is_none() || status.running_job_id == Some(second_id.clone()));

    second.wait().await.unwrap();
    wait_for_slot(&fx.scheduler, "0", |s| *s == SlotStatus::default()).await;
    assert_eq!(fx.scheduler.total_pending().unwrap(), 0);
    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_validation_errors_are_synchronous() {
    let fx = start(&["0", "1"], Duration::from_secs(30));

    let unknown = fx
        .scheduler
        .submit(ParseJob::new("a").with_slot(SlotSelector::Slot(SlotId::new("7"))));
    assert!(matches!(unknown, Err(PipelineError::Validation { .. })));

    let empty = fx.scheduler.submit(ParseJob::new("  "));
    assert!(matches!(empty, Err(PipelineError::Validation { .. })));

    let zero = fx.scheduler.submit(ParseJob::new("a").with_timeout(0));
    assert!(matches!(zero, Err(PipelineError::Validation { .. })));

    assert_eq!(fx.scheduler.total_pending().unwrap(), 0);
    fx.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_any_selects_least_loaded_then_lowest_id() {
    let fx = start(&["1", "0"], Duration::from_secs(30));

    let first = fx.scheduler.submit(ParseJob::new("slow-any-1").with_timeout(2)).unwrap();
    let second = fx.scheduler.submit(ParseJob::new("slow-any-2").with_timeout(2)).unwrap();
    let third = fx.scheduler.submit(ParseJob::new("c")).unwrap();

    assert_eq!(first.snapshot().slot_id, SlotId::new("0"));
    assert_eq!(second.snapshot().slot_id, SlotId::new("1"));
    assert_eq!(third.snapshot().slot_id, SlotId::new("0"));

    let pinned = fx
        .scheduler
        .submit(ParseJob::new("d").with_slot(SlotSelector::Slot(SlotId::new("1"))))
        .unwrap();
    assert_eq!(pinned.snapshot().slot_id, SlotId::new("1"));

    for handle in [first, second] {
        assert!(matches!(handle.wait().await, Err(PipelineError::ResourceTimeout { .. })));
    }
    third.wait().await.unwrap();
    pinned.wait().await.unwrap();
    fx.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_queued_and_running_jobs() {
    let fx = start(&["0"], Duration::from_secs(30));

    let running = fx.scheduler.submit(ParseJob::new("slow-cancel")).unwrap();
    let queued = fx.scheduler.submit(ParseJob::new("b")).unwrap();
    let running_id = running.job_id().clone();
    let queued_id = queued.job_id().clone();

    assert!(fx.scheduler.cancel(&queued_id).await.unwrap());
    assert_eq!(queued.wait().await.unwrap_err(), PipelineError::Cancelled);

    // 等作业真正启动后再取消
    let deadline = Instant::now() + Duration::from_secs(5);
    while fx.scheduler.get_state(&running_id).unwrap().state != JobState::Running {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let started = Instant::now();
    assert!(fx.scheduler.cancel(&running_id).await.unwrap());
    assert_eq!(running.wait().await.unwrap_err(), PipelineError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));

    // 已结束的作业无法再取消
    assert!(!fx.scheduler.cancel(&running_id).await.unwrap());
    assert!(!events(fx.dir.path()).contains(&"start b".to_string()));
    fx.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crash_is_backend_failure_with_stage() {
    let fx = start(&["0"], Duration::from_secs(30));

    let err = fx.scheduler.submit(ParseJob::new("crash")).unwrap().wait().await.unwrap_err();
    match err {
        PipelineError::BackendFailure { stage, message } => {
            assert_eq!(stage, Stage::Parse);
            assert!(message.contains("segmentation fault"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // 崩溃不影响槽位继续工作
    fx.scheduler.submit(ParseJob::new("after")).unwrap().wait().await.unwrap();
    fx.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hybrid_backend_falls_back_to_vlm() {
    let fx = start(&["0"], Duration::from_secs(30));

    let result = fx
        .scheduler
        .submit(ParseJob::new("x").with_backend(ParseBackend::HybridHttpClient))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.elements[0].text, "vlm-http-client");
    fx.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_drains_and_rejects() {
    let fx = start(&["0"], Duration::from_secs(30));

    let running = fx.scheduler.submit(ParseJob::new("r")).unwrap();
    let queued = fx.scheduler.submit(ParseJob::new("q")).unwrap();

    fx.scheduler.shutdown().await;

    // 运行中的作业正常完成，排队的作业被拒绝
    running.wait().await.unwrap();
    assert_eq!(queued.wait().await.unwrap_err(), PipelineError::ShuttingDown);
    assert!(matches!(
        fx.scheduler.submit(ParseJob::new("late")),
        Err(PipelineError::ShuttingDown)
    ));
}

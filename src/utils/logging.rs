/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// 初始化全局日志订阅者
///
/// 日志级别由 `RUST_LOG` 控制，默认 `info`；重复初始化会被忽略。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `config`: 程序配置
pub fn log_startup(config: &Config) {
    let slots: Vec<&str> = config.gpu_ids.iter().map(|s| s.as_str()).collect();
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 加速卡解析 + 视觉增强两阶段流水线");
    info!("🖥️ 加速卡槽位: [{}]", slots.join(", "));
    info!("⏱️ 解析硬超时: {}s", config.parse_hard_timeout_seconds);
    info!(
        "👁️ 视觉模型: {} ({} 个增强 worker)",
        config.vision_provider, config.enrich_workers
    );
    info!("📊 最大并发请求数: {}", config.max_concurrent_requests);
    info!("{}", "=".repeat(60));
}

/// 记录请求加载信息
///
/// # 参数
/// - `total`: 请求总数
/// - `max_concurrent`: 最大并发数
pub fn log_requests_loaded(total: usize, max_concurrent: usize) {
    info!("✓ 找到 {} 个待处理的请求", total);
    info!("📋 将以每批 {} 个的方式处理", max_concurrent);
    info!("💡 每批完成后再开始下一批\n");
}

/// 记录批次开始信息
///
/// # 参数
/// - `batch_num`: 批次编号
/// - `total_batches`: 批次总数
/// - `start`: 起始请求编号
/// - `end`: 结束请求编号
/// - `total`: 请求总数
pub fn log_batch_start(
    batch_num: usize,
    total_batches: usize,
    start: usize,
    end: usize,
    total: usize,
) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始处理第 {}/{} 批", batch_num, total_batches);
    info!("📄 本批请求: {}-{} / 共 {} 个", start, end, total);
    info!("{}", "=".repeat(60));
}

/// 记录批次完成信息
pub fn log_batch_complete(batch_num: usize, success: usize, partial: usize, total: usize) {
    info!("\n{}", "─".repeat(60));
    info!(
        "✓ 第 {} 批完成: 成功 {}/{}，部分成功 {}",
        batch_num, success, total, partial
    );
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `success`: 完全成功数量
/// - `partial`: 部分成功数量
/// - `failed`: 失败数量
/// - `total`: 总数
/// - `output_folder`: 结果输出目录
pub fn print_final_stats(success: usize, partial: usize, failed: usize, total: usize, output_folder: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", success, total);
    info!("⚠️ 部分成功: {}", partial);
    info!("❌ 失败: {}", failed);
    info!("{}", "=".repeat(60));
    info!("\n结果已保存至: {}", output_folder);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

/// 保留文本末尾部分（用于 stderr 等尾部信息更重要的输出）
pub fn tail_text(text: &str, max_len: usize) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count > max_len {
        "...".to_string() + &text.chars().skip(count - max_len).collect::<String>()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("短文本", 10), "短文本");
        assert_eq!(truncate_text("一二三四五", 3), "一二三...");
    }

    #[test]
    fn test_tail_text() {
        assert_eq!(tail_text("  abc \n", 10), "abc");
        assert_eq!(tail_text("line1\nline2\nfatal", 5), "...fatal");
        assert_eq!(tail_text("0123456789", 4), "...6789");
    }
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::{ParseBackend, SlotId, VisionProvider};
use crate::workflow::image_jobs::ImageFilter;
use crate::workflow::merge::AllFailedPolicy;

/// 单个视觉模型提供方的连接配置
#[derive(Clone, Debug, Default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    /// 多个端点按轮询方式使用
    pub base_urls: Vec<String>,
}

/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    // --- 加速卡调度 ---
    /// 加速卡槽位列表，每个槽位独占一张卡
    pub gpu_ids: Vec<SlotId>,
    /// 解析 worker 可执行文件
    pub parse_worker_program: String,
    pub parse_worker_args: Vec<String>,
    /// 解析作业默认硬超时（秒）
    pub parse_hard_timeout_seconds: u64,
    pub default_backend: ParseBackend,
    /// 作业临时目录的根目录
    pub task_storage_dir: PathBuf,
    // --- 增强队列 ---
    pub enrich_queue: String,
    pub enrich_urgent_queue: String,
    /// 增强 worker 数量
    pub enrich_workers: usize,
    pub vision_request_timeout_seconds: u64,
    // --- 汇合与结果 ---
    pub join_timeout_seconds: u64,
    pub join_poll_interval_ms: u64,
    /// 结果保留时长（秒）
    pub result_expires_seconds: u64,
    pub all_failed_policy: AllFailedPolicy,
    pub image_filter: ImageFilter,
    // --- 视觉模型 ---
    pub vision_provider: VisionProvider,
    /// 覆盖提供方默认模型
    pub vision_model: Option<String>,
    pub providers: HashMap<VisionProvider, ProviderSettings>,
    // --- 批处理 ---
    /// 同时处理的请求数量
    pub max_concurrent_requests: usize,
    /// 请求清单目录
    pub request_folder: String,
    /// 结果输出目录
    pub output_folder: String,
}

impl Default for Config {
    fn default() -> Self {
        let providers = VisionProvider::ALL
            .iter()
            .map(|provider| {
                (
                    *provider,
                    ProviderSettings {
                        api_key: None,
                        base_urls: vec![provider.default_base_url().to_string()],
                    },
                )
            })
            .collect();

        Self {
            gpu_ids: vec![SlotId::new("0")],
            parse_worker_program: "mineru-parse-worker".to_string(),
            parse_worker_args: Vec::new(),
            parse_hard_timeout_seconds: 600,
            default_backend: ParseBackend::Pipeline,
            task_storage_dir: std::env::temp_dir().join("gpu_parse_pipeline_tasks"),
            enrich_queue: "queue_vision".to_string(),
            enrich_urgent_queue: "queue_vision_urgent".to_string(),
            enrich_workers: 8,
            vision_request_timeout_seconds: 120,
            join_timeout_seconds: 1800,
            join_poll_interval_ms: 500,
            result_expires_seconds: 86400,
            all_failed_policy: AllFailedPolicy::Partial,
            image_filter: ImageFilter::default(),
            vision_provider: VisionProvider::OpenAi,
            vision_model: None,
            providers,
            max_concurrent_requests: 8,
            request_folder: "requests".to_string(),
            output_folder: "output".to_string(),
        }
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意键值来源加载配置，未设置的键使用默认值
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();
        let env = EnvReader { lookup };

        let gpu_ids = match env.get("GPU_IDS") {
            Some(raw) => split_list(&raw).into_iter().map(SlotId::new).collect(),
            None => default.gpu_ids,
        };
        if gpu_ids.is_empty() {
            return Err(ConfigError::Invalid("GPU_IDS 至少需要一个槽位".to_string()));
        }

        let mut providers = default.providers;
        for provider in VisionProvider::ALL {
            let prefix = provider.name().to_ascii_uppercase();
            let settings = providers.entry(provider).or_default();
            if let Some(key) = env.get(&format!("{}_API_KEY", prefix)) {
                settings.api_key = Some(key);
            }
            if let Some(urls) = env.get(&format!("{}_BASE_URLS", prefix)) {
                let urls = split_list(&urls);
                if !urls.is_empty() {
                    settings.base_urls = urls;
                }
            }
        }

        let image_filter = ImageFilter {
            min_area_ratio: env.parse("MIN_IMAGE_AREA_RATIO", default.image_filter.min_area_ratio)?,
            min_area_ratio_with_caption: env.parse(
                "MIN_IMAGE_AREA_RATIO_WITH_CAPTION",
                default.image_filter.min_area_ratio_with_caption,
            )?,
            max_aspect_ratio: env.parse("MAX_IMAGE_ASPECT_RATIO", default.image_filter.max_aspect_ratio)?,
            per_page_limit: env.parse("PER_PAGE_IMAGE_LIMIT", default.image_filter.per_page_limit)?,
        };

        let config = Self {
            gpu_ids,
            parse_worker_program: env.get("PARSE_WORKER_PROGRAM").unwrap_or(default.parse_worker_program),
            parse_worker_args: env
                .get("PARSE_WORKER_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or(default.parse_worker_args),
            parse_hard_timeout_seconds: env.parse("PARSE_HARD_TIMEOUT_SECONDS", default.parse_hard_timeout_seconds)?,
            default_backend: env.parse_enum("MINERU_DEFAULT_BACKEND", default.default_backend)?,
            task_storage_dir: env.get("TASK_STORAGE_DIR").map(PathBuf::from).unwrap_or(default.task_storage_dir),
            enrich_queue: env.get("ENRICH_QUEUE").unwrap_or(default.enrich_queue),
            enrich_urgent_queue: env.get("ENRICH_URGENT_QUEUE").unwrap_or(default.enrich_urgent_queue),
            enrich_workers: env.parse("ENRICH_WORKERS", default.enrich_workers)?,
            vision_request_timeout_seconds: env
                .parse("VISION_REQUEST_TIMEOUT_SECONDS", default.vision_request_timeout_seconds)?,
            join_timeout_seconds: env.parse("JOIN_TIMEOUT_SECONDS", default.join_timeout_seconds)?,
            join_poll_interval_ms: env.parse("JOIN_POLL_INTERVAL_MS", default.join_poll_interval_ms)?,
            result_expires_seconds: env.parse("RESULT_EXPIRES", default.result_expires_seconds)?,
            all_failed_policy: env.parse_enum("ALL_ENRICHMENTS_FAILED", default.all_failed_policy)?,
            image_filter,
            vision_provider: env.parse_enum("VISION_PROVIDER", default.vision_provider)?,
            vision_model: env.get("VISION_MODEL").or(default.vision_model),
            providers,
            max_concurrent_requests: env.parse("MAX_CONCURRENT_REQUESTS", default.max_concurrent_requests)?,
            request_folder: env.get("REQUEST_FOLDER").unwrap_or(default.request_folder),
            output_folder: env.get("OUTPUT_FOLDER").unwrap_or(default.output_folder),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enrich_queue == self.enrich_urgent_queue {
            return Err(ConfigError::Invalid("ENRICH_QUEUE 与 ENRICH_URGENT_QUEUE 不能相同".to_string()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid("MAX_CONCURRENT_REQUESTS 必须大于 0".to_string()));
        }
        if self.parse_hard_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("PARSE_HARD_TIMEOUT_SECONDS 必须大于 0".to_string()));
        }
        Ok(())
    }

    pub fn vision_request_timeout(&self) -> Duration {
        Duration::from_secs(self.vision_request_timeout_seconds)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_seconds)
    }

    pub fn join_poll_interval(&self) -> Duration {
        Duration::from_millis(self.join_poll_interval_ms.max(1))
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_expires_seconds)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// 读取非空值
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// 读取并解析；设置了但无法解析时报错，不静默回退默认值
    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: key.to_string(),
                value: raw,
                expected_type: std::any::type_name::<T>().to_string(),
            }),
            None => Ok(default),
        }
    }

    /// 读取封闭枚举，未知取值直接返回枚举自身的错误
    fn parse_enum<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr<Err = ConfigError>,
    {
        match self.get(key) {
            Some(raw) => raw.parse(),
            None => Ok(default),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

//! 视觉模型服务 - 业务能力层
//!
//! 只负责"描述一张图片"的能力，不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 兼容 OpenAI API 的服务（OpenAI、Gemini、vLLM 等）
//! - 每个提供方可以配置多个端点，按轮询方式分摊请求

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use crate::config::{Config, ProviderSettings};
use crate::error::{ConfigError, PipelineError, PipelineResult, Stage};
use crate::models::{EnrichmentJob, VisionProvider};
use crate::utils::logging::truncate_text;
use crate::services::enrichment_worker::EnrichmentBackend;
use crate::services::vision_prompts::build_vision_prompt;

/// vLLM 等本地服务不校验 Key 时使用的占位值
const PLACEHOLDER_API_KEY: &str = "not-required";
/// 调试日志中保留的原始回复长度
const RAW_REPLY_PREVIEW_CHARS: usize = 200;

/// 单个提供方的客户端池（轮询）
struct ClientPool {
    clients: Vec<(String, Client<OpenAIConfig>)>,
    next: AtomicUsize,
}

impl ClientPool {
    fn new(api_key: &str, base_urls: &[String]) -> Self {
        let clients = base_urls
            .iter()
            .map(|url| {
                let config = OpenAIConfig::new().with_api_key(api_key).with_api_base(url);
                (url.clone(), Client::with_config(config))
            })
            .collect();
        Self {
            clients,
            next: AtomicUsize::new(0),
        }
    }

    /// 轮询取下一个客户端
    fn next(&self) -> Option<&(String, Client<OpenAIConfig>)> {
        if self.clients.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients.get(index)
    }
}

/// 视觉模型服务
///
/// 职责：
/// - 读取图片并编码为 data URL
/// - 组合提示词并调用多模态对话接口
/// - 清理响应中的定位标记
/// - 只处理单张图片，不关心请求和汇合
pub struct VisionService {
    pools: HashMap<VisionProvider, ClientPool>,
    default_provider: VisionProvider,
    model_override: Option<String>,
    marker_re: Regex,
}

impl VisionService {
    /// 创建视觉模型服务
    ///
    /// 默认提供方缺少必需的 API Key 时返回配置错误；
    /// 其他提供方缺少 Key 时不创建客户端池，请求时报错。
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let mut pools = HashMap::new();
        for provider in VisionProvider::ALL {
            let settings = config.providers.get(&provider).cloned().unwrap_or_else(|| ProviderSettings {
                api_key: None,
                base_urls: vec![provider.default_base_url().to_string()],
            });
            let api_key = match (&settings.api_key, provider.requires_api_key()) {
                (Some(key), _) => key.clone(),
                (None, false) => PLACEHOLDER_API_KEY.to_string(),
                (None, true) => {
                    if provider == config.vision_provider {
                        return Err(ConfigError::Invalid(format!(
                            "视觉模型提供方 {} 需要设置 {}_API_KEY",
                            provider,
                            provider.name().to_ascii_uppercase()
                        )));
                    }
                    continue;
                }
            };
            if settings.base_urls.is_empty() {
                continue;
            }
            pools.insert(provider, ClientPool::new(&api_key, &settings.base_urls));
        }

        let marker_re = Regex::new(r"\[Page \d+\]|\[ChunkType=[^\]]*\]")
            .map_err(|e| ConfigError::Invalid(format!("标记正则无效: {}", e)))?;

        Ok(Self {
            pools,
            default_provider: config.vision_provider,
            model_override: config.vision_model.clone(),
            marker_re,
        })
    }

    /// 描述一张图片
    ///
    /// # 参数
    /// - `job`: 增强作业（图片路径、上下文、请求级选项）
    ///
    /// # 返回
    /// 返回清理后的描述文本
    pub async fn describe_image(&self, job: &EnrichmentJob) -> PipelineResult<String> {
        let provider = job.options.provider.unwrap_or(self.default_provider);
        let model = self.resolve_model(provider, job);
        let (endpoint, client) = self
            .pools
            .get(&provider)
            .and_then(ClientPool::next)
            .ok_or_else(|| PipelineError::backend(Stage::Enrich, format!("视觉模型提供方 {} 未配置", provider)))?;

        let image_url = encode_image(Path::new(&job.image_ref)).await?;
        let prompt = build_vision_prompt(&job.context, job.options.prompt.as_deref());

        debug!(
            "调用视觉模型 {} ({}), 图片 {}, 提示词 {} 字符",
            model,
            endpoint,
            job.image_ref,
            prompt.chars().count()
        );

        let content_parts = vec![
            ChatCompletionRequestUserMessageContentPart::Text(ChatCompletionRequestMessageContentPartText {
                text: prompt,
            }),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(ChatCompletionRequestMessageContentPartImage {
                image_url: ImageUrl {
                    url: image_url,
                    detail: Some(ImageDetail::Auto),
                },
            }),
        ];

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
            .build()
            .map_err(|e| PipelineError::backend(Stage::Enrich, format!("构建请求消息失败: {}", e)))?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&model)
            .messages(vec![ChatCompletionRequestMessage::User(user_msg)])
            .max_completion_tokens(1024u32)
            .build()
            .map_err(|e| PipelineError::backend(Stage::Enrich, format!("构建请求失败: {}", e)))?;

        let response = client.chat().create(request).await.map_err(|e| {
            warn!("视觉模型调用失败 ({}): {}", endpoint, e);
            PipelineError::backend(Stage::Enrich, format!("视觉模型调用失败 ({}): {}", endpoint, e))
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| PipelineError::backend(Stage::Enrich, format!("视觉模型返回内容为空 (模型: {})", model)))?;

        debug!("视觉模型原始回复: {}", truncate_text(&content, RAW_REPLY_PREVIEW_CHARS));
        let cleaned = self.clean_response(&content);
        info!("👁️ 图片 {} 描述完成 ({} 字符)", job.image_ref, cleaned.chars().count());
        Ok(cleaned)
    }

    fn resolve_model(&self, provider: VisionProvider, job: &EnrichmentJob) -> String {
        job.options
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.model_override.clone())
            .unwrap_or_else(|| provider.default_model().to_string())
    }

    /// 去掉响应中残留的 `[Page N]` / `[ChunkType=...]` 标记
    fn clean_response(&self, raw: &str) -> String {
        let stripped = self.marker_re.replace_all(raw, "");
        stripped
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

#[async_trait]
impl EnrichmentBackend for VisionService {
    async fn enrich(&self, job: &EnrichmentJob) -> PipelineResult<String> {
        self.describe_image(job).await
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// 读取图片并编码为 data URL
async fn encode_image(path: &Path) -> PipelineResult<String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        PipelineError::backend(Stage::Enrich, format!("无法读取图片 {}: {}", path.display(), e))
    })?;
    Ok(format!("data:{};base64,{}", mime_for(path), STANDARD.encode(bytes)))
}

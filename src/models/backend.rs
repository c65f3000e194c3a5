//! 后端枚举：文档解析后端与视觉模型提供方
//!
//! 两者都是封闭枚举，在配置加载或请求清单反序列化时完成校验，
//! 运行期不再出现未知取值。

use phf::phf_map;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// 文档解析后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ParseBackend {
    #[default]
    Pipeline,
    VlmTransformers,
    VlmVllmEngine,
    VlmLmdeployEngine,
    VlmHttpClient,
    VlmMlxEngine,
    HybridAutoEngine,
    HybridHttpClient,
}

static PARSE_BACKENDS: phf::Map<&'static str, ParseBackend> = phf_map! {
    "pipeline" => ParseBackend::Pipeline,
    "vlm-transformers" => ParseBackend::VlmTransformers,
    "vlm-vllm-engine" => ParseBackend::VlmVllmEngine,
    "vlm-lmdeploy-engine" => ParseBackend::VlmLmdeployEngine,
    "vlm-http-client" => ParseBackend::VlmHttpClient,
    "vlm-mlx-engine" => ParseBackend::VlmMlxEngine,
    "hybrid-auto-engine" => ParseBackend::HybridAutoEngine,
    "hybrid-http-client" => ParseBackend::HybridHttpClient,
};

impl ParseBackend {
    /// 后端名称（传给 worker 的值）
    pub fn name(self) -> &'static str {
        match self {
            ParseBackend::Pipeline => "pipeline",
            ParseBackend::VlmTransformers => "vlm-transformers",
            ParseBackend::VlmVllmEngine => "vlm-vllm-engine",
            ParseBackend::VlmLmdeployEngine => "vlm-lmdeploy-engine",
            ParseBackend::VlmHttpClient => "vlm-http-client",
            ParseBackend::VlmMlxEngine => "vlm-mlx-engine",
            ParseBackend::HybridAutoEngine => "hybrid-auto-engine",
            ParseBackend::HybridHttpClient => "hybrid-http-client",
        }
    }

    /// 解析为实际执行的后端：hybrid 后端回退到对应的 vlm 后端
    pub fn resolve(self) -> ParseBackend {
        match self {
            ParseBackend::HybridHttpClient => ParseBackend::VlmHttpClient,
            ParseBackend::HybridAutoEngine => ParseBackend::VlmVllmEngine,
            other => other,
        }
    }

    fn supported() -> String {
        let mut names: Vec<&str> = PARSE_BACKENDS.keys().copied().collect();
        names.sort_unstable();
        names.join(", ")
    }
}

impl FromStr for ParseBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        PARSE_BACKENDS
            .get(key.as_str())
            .copied()
            .ok_or_else(|| ConfigError::UnsupportedValue {
                kind: "解析后端",
                value: s.to_string(),
                supported: ParseBackend::supported(),
            })
    }
}

impl TryFrom<String> for ParseBackend {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ParseBackend> for String {
    fn from(value: ParseBackend) -> Self {
        value.name().to_string()
    }
}

impl fmt::Display for ParseBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 视觉模型提供方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VisionProvider {
    #[default]
    OpenAi,
    Gemini,
    Vllm,
}

impl VisionProvider {
    pub const ALL: [VisionProvider; 3] = [
        VisionProvider::OpenAi,
        VisionProvider::Gemini,
        VisionProvider::Vllm,
    ];

    pub fn name(self) -> &'static str {
        match self {
            VisionProvider::OpenAi => "openai",
            VisionProvider::Gemini => "gemini",
            VisionProvider::Vllm => "vllm",
        }
    }

    /// 默认模型
    pub fn default_model(self) -> &'static str {
        match self {
            VisionProvider::OpenAi => "gpt-5-mini",
            VisionProvider::Gemini => "gemini-2.5-flash",
            VisionProvider::Vllm => "Qwen/Qwen2.5-VL-72B-Instruct-AWQ",
        }
    }

    /// 默认 API 端点
    pub fn default_base_url(self) -> &'static str {
        match self {
            VisionProvider::OpenAi => "https://api.openai.com/v1",
            VisionProvider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            VisionProvider::Vllm => "http://localhost:8000/v1",
        }
    }

    /// 是否必须提供 API Key（本地 vLLM 可以不需要）
    pub fn requires_api_key(self) -> bool {
        !matches!(self, VisionProvider::Vllm)
    }
}

impl FromStr for VisionProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(VisionProvider::OpenAi),
            "gemini" => Ok(VisionProvider::Gemini),
            "vllm" => Ok(VisionProvider::Vllm),
            _ => Err(ConfigError::UnsupportedValue {
                kind: "视觉模型提供方",
                value: s.to_string(),
                supported: "openai, gemini, vllm".to_string(),
            }),
        }
    }
}

impl TryFrom<String> for VisionProvider {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VisionProvider> for String {
    fn from(value: VisionProvider) -> Self {
        value.name().to_string()
    }
}

impl fmt::Display for VisionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend_from_str() {
        assert_eq!("pipeline".parse::<ParseBackend>().unwrap(), ParseBackend::Pipeline);
        assert_eq!(
            " VLM-vLLM-Engine ".parse::<ParseBackend>().unwrap(),
            ParseBackend::VlmVllmEngine
        );
        let err = "magic".parse::<ParseBackend>().unwrap_err();
        assert!(err.to_string().contains("magic"));
        assert!(err.to_string().contains("pipeline"));
    }

    #[test]
    fn test_hybrid_backends_fall_back() {
        assert_eq!(ParseBackend::HybridHttpClient.resolve(), ParseBackend::VlmHttpClient);
        assert_eq!(ParseBackend::HybridAutoEngine.resolve(), ParseBackend::VlmVllmEngine);
        assert_eq!(ParseBackend::Pipeline.resolve(), ParseBackend::Pipeline);
    }

    #[test]
    fn test_backend_names_round_trip_through_map() {
        for backend in PARSE_BACKENDS.values() {
            assert_eq!(backend.name().parse::<ParseBackend>().unwrap(), *backend);
        }
    }

    #[test]
    fn test_vision_provider_defaults() {
        assert_eq!("Gemini".parse::<VisionProvider>().unwrap(), VisionProvider::Gemini);
        assert!("claude".parse::<VisionProvider>().is_err());
        assert_eq!(VisionProvider::OpenAi.default_model(), "gpt-5-mini");
        assert!(!VisionProvider::Vllm.requires_api_key());
    }
}

//! 视觉模型提示词

/// 没有上下文也没有自定义提示词时使用
pub const DEFAULT_VISION_PROMPT: &str = "What is in this image? Base your answer primarily on the visual content; \
if the surrounding context conflicts with or seems unrelated to the image, ignore it and trust what you see. \
Only return neat facts. Respond directly with the core findings; do not add lead-in phrases such as \
'Based on the context' or 'Here is the summary', and avoid Chinese introductions like '根据您提供的上下文信息' or '以下是'. \
Do not include any [Page ...] or [ChunkType=...] markers in your response.";

/// 组合提示词
///
/// # 参数
/// - `context`: 图片上下文（标题、脚注、前后文）
/// - `prompt_override`: 请求级自定义提示词
///
/// # 返回
/// - 有自定义提示词：自定义提示词 + 上下文块
/// - 仅有上下文：带上下文的分析提示词
/// - 都没有：默认提示词
pub fn build_vision_prompt(context: &str, prompt_override: Option<&str>) -> String {
    let context = context.trim();

    if let Some(custom) = prompt_override.map(str::trim).filter(|p| !p.is_empty()) {
        if context.is_empty() {
            return custom.to_string();
        }
        return format!(
            "{}\n\nContext (lines may include [Page N] and [ChunkType=Title] markers; \
use them only for positioning and do not output them):\n{}",
            custom, context
        );
    }

    if !context.is_empty() {
        return format!(
            "Analyze this image with the following context. Lines may include [Page N] and \
[ChunkType=Title] markers indicating document structure:\n{}\n\
Describe what is visually present first, using the page and title cues only to clarify placement. \
If the text context conflicts with or seems unrelated to the visible content, explicitly prefer the image \
and ignore that context. Only return neat facts in the language of the context. Respond with the key details only; \
do not preface the answer with meta commentary such as '根据您提供的上下文信息' or '以下是', \
and do not repeat any [Page ...] or [ChunkType=...] markers.",
            context
        );
    }

    DEFAULT_VISION_PROMPT.to_string()
}

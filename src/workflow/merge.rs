//! 合并归约：把有序解析结果与按图片引用归档的增强结果合并为最终输出
//!
//! 纯函数，输出顺序只由解析结果的 `index` 决定，与增强结果到达顺序无关。

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use crate::error::{ConfigError, PipelineError, Stage};
use crate::models::{
    AggregateResult, AggregateStatus, ElementFailure, ElementKind, EnrichmentResult, OutputElement,
    ParseResult, StructureTag,
};

/// 全部增强失败时的聚合状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllFailedPolicy {
    #[default]
    Partial,
    Failure,
}

impl FromStr for AllFailedPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "partial" => Ok(AllFailedPolicy::Partial),
            "failure" => Ok(AllFailedPolicy::Failure),
            _ => Err(ConfigError::UnsupportedValue {
                kind: "全部增强失败策略",
                value: s.to_string(),
                supported: "partial, failure".to_string(),
            }),
        }
    }
}

/// 合并选项
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// 结构化模式
    pub preserve_structure: bool,
    /// 生成扁平化文本
    pub return_text: bool,
    pub all_failed_policy: AllFailedPolicy,
}

/// 合并入口：解析失败时直接返回失败结果，不会得到空的成功结果
pub fn merge_or_fail(
    parse: Result<&ParseResult, PipelineError>,
    enrichments: &HashMap<String, EnrichmentResult>,
    requested: &HashSet<String>,
    options: MergeOptions,
) -> AggregateResult {
    match parse {
        Ok(parse) => merge(parse, enrichments, requested, options),
        Err(error) => AggregateResult::failed(error),
    }
}

/// 合并解析结果与增强结果
///
/// # 参数
/// - `parse`: 解析结果
/// - `enrichments`: 图片引用 → 增强结果
/// - `requested`: 请求了增强的图片引用；不在其中的图片原样输出且不标记失败
/// - `options`: 合并选项
pub fn merge(
    parse: &ParseResult,
    enrichments: &HashMap<String, EnrichmentResult>,
    requested: &HashSet<String>,
    options: MergeOptions,
) -> AggregateResult {
    let mut emitted: Vec<(OutputElement, bool)> = Vec::new();
    let mut failures = Vec::new();
    let mut consumed: HashSet<&str> = HashSet::new();

    for element in parse.in_document_order() {
        match element.kind {
            ElementKind::PageNumber => continue,
            ElementKind::Header | ElementKind::Footer if !options.preserve_structure => continue,
            _ => {}
        }

        let mut text = element.text.clone();
        // 同一图片引用只由第一次出现消费增强结果
        if let Some(key) = element.image_key().filter(|k| requested.contains(*k)) {
            if consumed.insert(key) {
                let enrichment = enrichments.get(key);
                match enrichment.and_then(EnrichmentResult::usable_text) {
                    Some(description) => text = with_description(&element.text, description),
                    None => failures.push(ElementFailure {
                        source_index: element.index,
                        image_ref: key.to_string(),
                        reason: enrichment
                            .and_then(|r| r.error.clone())
                            .unwrap_or_else(|| "缺少增强结果".to_string()),
                    }),
                }
            }
        }

        let tag = if options.preserve_structure {
            match element.kind {
                ElementKind::Title => Some(StructureTag::Title),
                ElementKind::Header => Some(StructureTag::Header),
                ElementKind::Footer => Some(StructureTag::Footer),
                _ => None,
            }
        } else {
            None
        };

        emitted.push((
            OutputElement {
                text,
                page_number: element.page_number,
                tag,
                source_index: element.index,
            },
            element.kind == ElementKind::Title,
        ));
    }

    if options.preserve_structure {
        // 页眉稳定地移到最前，其余保持原顺序
        let (headers, rest): (Vec<_>, Vec<_>) = emitted
            .into_iter()
            .partition(|(e, _)| e.tag == Some(StructureTag::Header));
        emitted = headers.into_iter().chain(rest).collect();
    }

    let text = options.return_text.then(|| flatten(&emitted));

    let total = consumed.len();
    let failed = failures.len();
    let (status, error) = if failed == 0 {
        (AggregateStatus::Success, None)
    } else if failed == total && options.all_failed_policy == AllFailedPolicy::Failure {
        (
            AggregateStatus::Failure,
            Some(PipelineError::backend(
                Stage::Enrich,
                format!("全部 {} 个图片增强失败", total),
            )),
        )
    } else {
        (
            AggregateStatus::Partial,
            Some(PipelineError::PartialFailure { failed, total }),
        )
    };

    AggregateResult {
        status,
        elements: emitted.into_iter().map(|(e, _)| e).collect(),
        failures,
        text,
        error,
    }
}

fn with_description(original: &str, description: &str) -> String {
    if original.trim().is_empty() {
        description.to_string()
    } else {
        format!("{}\nImage Description: {}", original, description)
    }
}

/// 扁平化文本：标题后空一行，其他元素后换行，跳过空元素
fn flatten(emitted: &[(OutputElement, bool)]) -> String {
    let mut out = String::new();
    for (element, is_title) in emitted {
        let text = element.text.trim();
        if text.is_empty() {
            continue;
        }
        out.push_str(text);
        out.push_str(if *is_title { "\n\n" } else { "\n" });
    }
    out.trim_end_matches('\n').to_string()
}

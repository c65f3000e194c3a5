//! 增强目标规划：从解析结果中挑选需要视觉增强的图片并组装上下文
//!
//! - 只处理带非空 `image_ref` 的图片元素
//! - 同一 `image_ref` 只生成一个作业（文档顺序中的第一次出现）
//! - 有几何信息时按面积占比、长宽比过滤，并限制每页图片数量
//! - 被过滤的图片不请求增强，合并时也不产生失败标记

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::models::{ElementKind, EnrichmentJob, ParseResult, StructuralElement, VisionOptions};

/// 前后文窗口大小（块数）
const CONTEXT_WINDOW: usize = 2;

/// 图片过滤规则
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageFilter {
    /// 图片面积 / 页面面积 的下限
    pub min_area_ratio: f64,
    /// 带标题或脚注的图片使用的下限
    pub min_area_ratio_with_caption: f64,
    /// 长宽比（长边 / 短边）上限
    pub max_aspect_ratio: f64,
    /// 每页最多增强的图片数
    pub per_page_limit: usize,
}

impl Default for ImageFilter {
    fn default() -> Self {
        Self {
            min_area_ratio: 0.01,
            min_area_ratio_with_caption: 0.005,
            max_aspect_ratio: 10.0,
            per_page_limit: 5,
        }
    }
}

impl ImageFilter {
    /// 返回跳过原因；`None` 表示保留
    fn skip_reason(&self, element: &StructuralElement) -> Option<String> {
        let bbox = element.bbox?;
        let has_caption = !element.text.trim().is_empty()
            || element.footnote.as_deref().is_some_and(|f| !f.trim().is_empty());

        if let Some(page) = element.page_size.filter(|p| p.0 > 0.0 && p.1 > 0.0) {
            let ratio = bbox.width() * bbox.height() / (page.0 * page.1);
            let min_ratio = if has_caption {
                self.min_area_ratio_with_caption
            } else {
                self.min_area_ratio
            };
            if ratio < min_ratio {
                return Some(format!("面积占比 {:.4} < {:.4}", ratio, min_ratio));
            }
        }

        let (w, h) = (bbox.width(), bbox.height());
        if w > 0.0 && h > 0.0 {
            let aspect = if w >= h { w / h } else { h / w };
            if aspect > self.max_aspect_ratio {
                return Some(format!("长宽比 {:.1} > {:.1}", aspect, self.max_aspect_ratio));
            }
        }
        None
    }
}

/// 增强规划结果
#[derive(Debug, Clone, Default)]
pub struct EnrichmentPlan {
    /// 待提交的增强作业，按文档顺序
    pub jobs: Vec<EnrichmentJob>,
    /// 被过滤掉的图片引用
    pub skipped: Vec<String>,
}

impl EnrichmentPlan {
    /// 实际请求了增强的图片引用集合
    pub fn requested(&self) -> HashSet<String> {
        self.jobs.iter().map(|job| job.image_ref.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// 规划增强作业
///
/// # 参数
/// - `parse`: 解析结果
/// - `filter`: 图片过滤规则
/// - `options`: 请求级视觉选项，原样附加到每个作业
pub fn plan_enrichment(parse: &ParseResult, filter: &ImageFilter, options: &VisionOptions) -> EnrichmentPlan {
    let ordered = parse.in_document_order();
    let context_blocks: Vec<(usize, &str)> = ordered
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                ElementKind::Title | ElementKind::Text | ElementKind::Table | ElementKind::Image
            )
        })
        .filter(|e| !e.text.trim().is_empty())
        .map(|e| (e.index, e.text.trim()))
        .collect();

    let mut plan = EnrichmentPlan::default();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut per_page: HashMap<u32, usize> = HashMap::new();

    for element in ordered.iter().copied() {
        let Some(key) = element.image_key() else {
            continue;
        };
        if !seen.insert(key) {
            continue;
        }

        if let Some(reason) = filter.skip_reason(element) {
            debug!("跳过图片 {} (第 {} 页): {}", key, element.page_number, reason);
            plan.skipped.push(key.to_string());
            continue;
        }

        let count = per_page.entry(element.page_number).or_default();
        if *count >= filter.per_page_limit {
            debug!("跳过图片 {}: 第 {} 页已达上限 {}", key, element.page_number, filter.per_page_limit);
            plan.skipped.push(key.to_string());
            continue;
        }
        *count += 1;

        plan.jobs.push(EnrichmentJob {
            image_ref: key.to_string(),
            context: build_context(element, &context_blocks),
            base_text: element.text.clone(),
            page_number: element.page_number,
            options: options.clone(),
        });
    }

    plan
}

fn build_context(element: &StructuralElement, blocks: &[(usize, &str)]) -> String {
    let before: Vec<&str> = blocks
        .iter()
        .filter(|(index, _)| *index < element.index)
        .map(|(_, text)| *text)
        .collect();
    let before = before[before.len().saturating_sub(CONTEXT_WINDOW)..].join("\n");
    let after = blocks
        .iter()
        .filter(|(index, _)| *index > element.index)
        .take(CONTEXT_WINDOW)
        .map(|(_, text)| *text)
        .collect::<Vec<_>>()
        .join("\n");

    let mut parts = Vec::new();
    if !element.text.trim().is_empty() {
        parts.push(format!("Image caption: {}", element.text.trim()));
    }
    if let Some(footnote) = element.footnote.as_deref().filter(|f| !f.trim().is_empty()) {
        parts.push(format!("Image footnote: {}", footnote.trim()));
    }
    if !before.is_empty() {
        parts.push(format!("Context before: {}", before));
    }
    if !after.is_empty() {
        parts.push(format!("Context after: {}", after));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, PageSize};

    fn text(index: usize, body: &str) -> StructuralElement {
        StructuralElement::new(index, ElementKind::Text, body)
    }

    #[test]
    fn test_context_windows() {
        let parse = ParseResult::new(vec![
            StructuralElement::new(0, ElementKind::Title, "Title"),
            text(1, "first"),
            StructuralElement::new(2, ElementKind::Header, "running header"),
            text(3, "second"),
            StructuralElement::image(4, "img/a.jpg", "Fig 1"),
            text(5, "after one"),
            text(6, ""),
            text(7, "after two"),
            text(8, "after three"),
        ]);
        let plan = plan_enrichment(&parse, &ImageFilter::default(), &VisionOptions::default());

        assert_eq!(plan.jobs.len(), 1);
        assert_eq!(
            plan.jobs[0].context,
            "Image caption: Fig 1\nContext before: first\nsecond\nContext after: after one\nafter two"
        );
        assert_eq!(plan.jobs[0].base_text, "Fig 1");
    }

    #[test]
    fn test_duplicate_refs_planned_once() {
        let parse = ParseResult::new(vec![
            StructuralElement::image(0, "img/a.jpg", "first"),
            StructuralElement::image(1, "img/a.jpg", "second"),
            StructuralElement::image(2, "img/b.jpg", ""),
            StructuralElement::image(3, "", "no ref"),
        ]);
        let plan = plan_enrichment(&parse, &ImageFilter::default(), &VisionOptions::default());

        let refs: Vec<&str> = plan.jobs.iter().map(|j| j.image_ref.as_str()).collect();
        assert_eq!(refs, vec!["img/a.jpg", "img/b.jpg"]);
        assert_eq!(plan.jobs[0].base_text, "first");
    }

    #[test]
    fn test_geometry_filters() {
        let page = PageSize(1000.0, 1000.0);
        let parse = ParseResult::new(vec![
            // 面积占比 0.0025，无标题 → 过滤
            StructuralElement::image(0, "tiny.jpg", "").with_geometry(BoundingBox(0.0, 0.0, 50.0, 50.0), page),
            // 面积占比 0.0064，有标题 → 保留
            StructuralElement::image(1, "captioned.jpg", "Fig").with_geometry(BoundingBox(0.0, 0.0, 80.0, 80.0), page),
            // 长宽比 20 → 过滤
            StructuralElement::image(2, "strip.jpg", "").with_geometry(BoundingBox(0.0, 0.0, 1000.0, 50.0), page),
            // 无几何信息 → 保留
            StructuralElement::image(3, "plain.jpg", ""),
        ]);
        let plan = plan_enrichment(&parse, &ImageFilter::default(), &VisionOptions::default());

        assert_eq!(plan.requested(), HashSet::from(["captioned.jpg".to_string(), "plain.jpg".to_string()]));
        assert_eq!(plan.skipped, vec!["tiny.jpg", "strip.jpg"]);
    }

    #[test]
    fn test_per_page_limit() {
        let elements = (0..7)
            .map(|i| StructuralElement::image(i, format!("p1-{i}.jpg"), "").on_page(1))
            .chain(std::iter::once(StructuralElement::image(7, "p2.jpg", "").on_page(2)))
            .collect();
        let filter = ImageFilter {
            per_page_limit: 5,
            ..ImageFilter::default()
        };
        let plan = plan_enrichment(&ParseResult::new(elements), &filter, &VisionOptions::default());

        assert_eq!(plan.jobs.len(), 6);
        assert_eq!(plan.skipped, vec!["p1-5.jpg", "p1-6.jpg"]);
    }
}

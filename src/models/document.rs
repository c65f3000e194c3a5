//! 解析结果：有序的结构化元素序列

use serde::{Deserialize, Serialize};

/// 结构化元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Title,
    Text,
    Image,
    Table,
    Header,
    Footer,
    PageNumber,
}

/// 元素在页面上的包围盒 `[x0, y0, x1, y1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox(pub f64, pub f64, pub f64, pub f64);

impl BoundingBox {
    pub fn width(&self) -> f64 {
        (self.2 - self.0).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.3 - self.1).max(0.0)
    }
}

/// 页面尺寸 `[width, height]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize(pub f64, pub f64);

/// 结构化元素
///
/// 图片元素的 `text` 是其标题（caption），`image_ref` 指向图片文件。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralElement {
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub page_number: u32,
    /// 图片脚注
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footnote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<PageSize>,
}

impl StructuralElement {
    pub fn new(index: usize, kind: ElementKind, text: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            text: text.into(),
            image_ref: None,
            page_number: 0,
            footnote: None,
            bbox: None,
            page_size: None,
        }
    }

    pub fn image(index: usize, image_ref: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            image_ref: Some(image_ref.into()),
            ..Self::new(index, ElementKind::Image, caption)
        }
    }

    pub fn on_page(mut self, page_number: u32) -> Self {
        self.page_number = page_number;
        self
    }

    pub fn with_geometry(mut self, bbox: BoundingBox, page_size: PageSize) -> Self {
        self.bbox = Some(bbox);
        self.page_size = Some(page_size);
        self
    }

    /// 非空的图片引用
    pub fn image_key(&self) -> Option<&str> {
        match (self.kind, self.image_ref.as_deref()) {
            (ElementKind::Image, Some(key)) if !key.trim().is_empty() => Some(key),
            _ => None,
        }
    }

    /// 是否需要视觉增强
    pub fn needs_enrichment(&self) -> bool {
        self.image_key().is_some()
    }
}

/// 解析结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub elements: Vec<StructuralElement>,
}

impl ParseResult {
    pub fn new(elements: Vec<StructuralElement>) -> Self {
        Self { elements }
    }

    /// 按 `index` 排序后的元素（稳定排序）
    pub fn in_document_order(&self) -> Vec<&StructuralElement> {
        let mut ordered: Vec<&StructuralElement> = self.elements.iter().collect();
        ordered.sort_by_key(|element| element.index);
        ordered
    }

    pub fn image_count(&self) -> usize {
        self.elements.iter().filter(|e| e.needs_enrichment()).count()
    }
}

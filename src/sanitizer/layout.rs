//! Page-layout model and the header-watermark planner
//!
//! Coordinates are in points with the origin at the top-left of the page, so
//! the header band is simply `top < band`.

use crate::config::SanitizerSection;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left: left.min(right),
            top: top.min(bottom),
            right: left.max(right),
            bottom: top.max(bottom),
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn center_y(&self) -> f32 {
        (self.top + self.bottom) / 2.0
    }

    pub fn intersects_band(&self, band: f32) -> bool {
        self.top < band && self.bottom > 0.0
    }
}

/// One drawing of an image on a page
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlacement {
    /// Identity of the underlying image, shared by every placement of it
    pub key: String,
    pub rect: Rect,
    /// Index of the drawing operation in the page's content stream
    pub op_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextFragment {
    pub text: String,
    pub rect: Rect,
    pub op_index: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageLayout {
    pub width: f32,
    pub height: f32,
    pub images: Vec<ImagePlacement>,
    pub texts: Vec<TextFragment>,
}

/// Operations to remove from one page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PagePlan {
    pub page: usize,
    pub image_ops: BTreeSet<usize>,
    pub text_ops: BTreeSet<usize>,
}

impl PagePlan {
    pub fn ops(&self) -> BTreeSet<usize> {
        self.image_ops.union(&self.text_ops).copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.image_ops.is_empty() && self.text_ops.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedactionPlan {
    /// Keys of images classified as repeated header logos
    pub header_images: Vec<String>,
    /// Only pages with at least one flagged region
    pub pages: Vec<PagePlan>,
}

impl RedactionPlan {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn images_removed(&self) -> usize {
        self.pages.iter().map(|p| p.image_ops.len()).sum()
    }

    pub fn texts_removed(&self) -> usize {
        self.pages.iter().map(|p| p.text_ops.len()).sum()
    }
}

/// Pages a placement must recur on to count as a header logo. The ratio
/// applies to the whole document, even when the first page is left alone.
pub fn required_pages(page_count: usize, params: &SanitizerSection) -> usize {
    let by_ratio = (page_count as f32 * params.min_repetition_ratio).round() as usize;
    params.min_repeating_pages.max(by_ratio)
}

fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Decide which header regions to remove from `pages`
pub fn plan_redactions(pages: &[PageLayout], params: &SanitizerSection) -> RedactionPlan {
    let band = params.header_band_pt;
    let first = if params.include_first_page { 0 } else { 1 };

    // image key -> (pages it qualifies on, centre of every qualifying placement)
    let mut recurrence: HashMap<&str, (BTreeSet<usize>, Vec<f32>)> = HashMap::new();
    for (index, page) in pages.iter().enumerate().skip(first) {
        let max_width = page.width * params.max_image_width_ratio;
        for image in &page.images {
            let rect = image.rect;
            if rect.intersects_band(band)
                && rect.height() <= params.max_image_height_pt
                && rect.width() <= max_width
            {
                let entry = recurrence.entry(image.key.as_str()).or_default();
                entry.0.insert(index);
                entry.1.push(rect.center_y());
            }
        }
    }

    let required = required_pages(pages.len(), params);
    let near_top = band * params.near_top_factor;
    let mut header_images: Vec<String> = recurrence
        .into_iter()
        .filter_map(|(key, (on_pages, mut centres))| {
            let centre = median(&mut centres)?;
            (on_pages.len() >= required && centre <= near_top).then(|| key.to_string())
        })
        .collect();
    header_images.sort();

    let keywords: Vec<String> = params.keywords.iter().map(|k| k.to_lowercase()).collect();

    let mut plans = Vec::new();
    for (index, page) in pages.iter().enumerate().skip(first) {
        let mut plan = PagePlan {
            page: index,
            ..Default::default()
        };
        for image in &page.images {
            if image.rect.intersects_band(band) && header_images.contains(&image.key) {
                plan.image_ops.insert(image.op_index);
            }
        }
        for fragment in &page.texts {
            if !fragment.rect.intersects_band(band) {
                continue;
            }
            let text = fragment.text.to_lowercase();
            if keywords.iter().any(|k| !k.is_empty() && text.contains(k.as_str())) {
                plan.text_ops.insert(fragment.op_index);
            }
        }
        if !plan.is_empty() {
            plans.push(plan);
        }
    }

    RedactionPlan {
        header_images,
        pages: plans,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A4_WIDTH: f32 = 595.0;

    fn logo(top: f32, height: f32, op: usize) -> ImagePlacement {
        ImagePlacement {
            key: "logo".to_string(),
            rect: Rect::new(40.0, top, 140.0, top + height),
            op_index: op,
        }
    }

    fn page(images: Vec<ImagePlacement>, texts: Vec<TextFragment>) -> PageLayout {
        PageLayout {
            width: A4_WIDTH,
            height: 842.0,
            images,
            texts,
        }
    }

    #[test]
    fn test_required_pages() {
        let params = SanitizerSection::default();
        assert_eq!(required_pages(6, &params), 3);
        assert_eq!(required_pages(20, &params), 8);
        assert_eq!(required_pages(1, &params), 3);
    }

    #[test]
    fn test_recurring_logo_removed_from_every_page() {
        let params = SanitizerSection::default();
        let mut pages: Vec<PageLayout> = (0..5).map(|_| page(vec![logo(10.0, 50.0, 1)], vec![])).collect();
        // Sixth page draws the same image too large to qualify on its own
        pages.push(page(vec![logo(5.0, 120.0, 3)], vec![]));

        let plan = plan_redactions(&pages, &params);
        assert_eq!(plan.header_images, vec!["logo"]);
        assert_eq!(plan.pages.len(), 6);
        assert_eq!(plan.pages[5].image_ops, BTreeSet::from([3]));
        assert_eq!(plan.images_removed(), 6);
    }

    #[test]
    fn test_rare_logo_is_kept() {
        let params = SanitizerSection::default();
        let mut pages: Vec<PageLayout> = (0..2).map(|_| page(vec![logo(10.0, 50.0, 0)], vec![])).collect();
        pages.extend((0..4).map(|_| page(vec![], vec![])));

        assert!(plan_redactions(&pages, &params).is_empty());
    }

    #[test]
    fn test_logo_below_near_top_is_kept() {
        let params = SanitizerSection::default();
        // Intersects the 70pt band but centred at 90pt, past 70 * 1.25
        let pages: Vec<PageLayout> = (0..6).map(|_| page(vec![logo(65.0, 50.0, 0)], vec![])).collect();

        assert!(plan_redactions(&pages, &params).is_empty());
    }

    #[test]
    fn test_wide_image_does_not_qualify() {
        let params = SanitizerSection::default();
        let banner = ImagePlacement {
            key: "banner".to_string(),
            rect: Rect::new(0.0, 0.0, A4_WIDTH, 40.0),
            op_index: 0,
        };
        let pages: Vec<PageLayout> = (0..6).map(|_| page(vec![banner.clone()], vec![])).collect();

        assert!(plan_redactions(&pages, &params).is_empty());
    }

    #[test]
    fn test_keyword_text_in_band_flagged_without_recurrence() {
        let params = SanitizerSection::default();
        let stamp = TextFragment {
            text: "Downloaded from IranPaper.ir".to_string(),
            rect: Rect::new(40.0, 20.0, 300.0, 32.0),
            op_index: 4,
        };
        let body = TextFragment {
            text: "downloaded from the archive".to_string(),
            rect: Rect::new(40.0, 400.0, 300.0, 412.0),
            op_index: 9,
        };
        let pages = vec![page(vec![], vec![stamp, body]), page(vec![], vec![])];

        let plan = plan_redactions(&pages, &params);
        assert_eq!(plan.pages.len(), 1);
        assert_eq!(plan.pages[0].text_ops, BTreeSet::from([4]));
        assert!(plan.header_images.is_empty());
    }

    #[test]
    fn test_first_page_can_be_excluded() {
        let params = SanitizerSection {
            include_first_page: false,
            ..Default::default()
        };
        let pages: Vec<PageLayout> = (0..4).map(|_| page(vec![logo(10.0, 50.0, 0)], vec![])).collect();

        let plan = plan_redactions(&pages, &params);
        assert_eq!(plan.pages.iter().map(|p| p.page).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_excluded_first_page_still_counts_toward_threshold() {
        let params = SanitizerSection {
            include_first_page: false,
            ..Default::default()
        };
        // Nine pages need four repeats; the eight after the cover alone would need three
        let mut pages: Vec<PageLayout> = (0..6).map(|_| page(vec![], vec![])).collect();
        pages.extend((0..3).map(|_| page(vec![logo(10.0, 50.0, 0)], vec![])));
        assert!(plan_redactions(&pages, &params).is_empty());

        pages[1] = page(vec![logo(10.0, 50.0, 0)], vec![]);
        let plan = plan_redactions(&pages, &params);
        assert_eq!(plan.header_images, vec!["logo"]);
        assert_eq!(plan.images_removed(), 4);
    }
}

//! lopdf backend: page-layout extraction and content-stream redaction

use super::layout::{ImagePlacement, PageLayout, RedactionPlan, Rect, TextFragment};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
/// Rough glyph advance as a fraction of the font size
const GLYPH_ADVANCE: f32 = 0.5;

type Matrix = [f32; 6];

fn multiply(m1: &Matrix, m2: &Matrix) -> Matrix {
    [
        m1[0] * m2[0] + m1[1] * m2[2],
        m1[0] * m2[1] + m1[1] * m2[3],
        m1[2] * m2[0] + m1[3] * m2[2],
        m1[2] * m2[1] + m1[3] * m2[3],
        m1[4] * m2[0] + m1[5] * m2[2] + m2[4],
        m1[4] * m2[1] + m1[5] * m2[3] + m2[5],
    ]
}

fn apply(m: &Matrix, x: f32, y: f32) -> (f32, f32) {
    (m[0] * x + m[2] * y + m[4], m[1] * x + m[3] * y + m[5])
}

fn translate(tx: f32, ty: f32) -> Matrix {
    [1.0, 0.0, 0.0, 1.0, tx, ty]
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

fn numbers<const N: usize>(operands: &[Object]) -> Option<[f32; N]> {
    if operands.len() < N {
        return None;
    }
    let mut out = [0.0; N];
    for (slot, operand) in out.iter_mut().zip(operands) {
        *slot = number(operand)?;
    }
    Some(out)
}

fn resolve<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

/// What survives of a removed operation. `'` and `"` move to the next line
/// (and `"` sets spacing) before showing text, so text after them keeps its place.
fn line_state_of(op: Operation) -> Vec<Operation> {
    match op.operator.as_str() {
        "'" => vec![Operation::new("T*", vec![])],
        "\"" => {
            let mut operands = op.operands.into_iter();
            match (operands.next(), operands.next()) {
                (Some(word), Some(char_spacing)) => vec![
                    Operation::new("Tw", vec![word]),
                    Operation::new("Tc", vec![char_spacing]),
                    Operation::new("T*", vec![]),
                ],
                _ => vec![Operation::new("T*", vec![])],
            }
        }
        _ => Vec::new(),
    }
}

/// Walk a page and its ancestors for an inheritable attribute
fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut current = doc.get_dictionary(page_id).ok()?;
    for _ in 0..32 {
        if let Ok(value) = current.get(key) {
            return resolve(doc, value);
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = doc.get_dictionary(parent).ok()?;
    }
    None
}

/// (x0, y0, x1, y1) of the page's media box, US Letter when absent
fn media_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
    inherited(doc, page_id, b"MediaBox")
        .and_then(|o| o.as_array().ok())
        .and_then(|a| numbers::<4>(a))
        .unwrap_or([0.0, 0.0, 612.0, 792.0])
}

/// Image XObjects named in the page's resources
fn page_images(doc: &Document, page_id: ObjectId) -> BTreeMap<Vec<u8>, ObjectId> {
    let mut images = BTreeMap::new();
    let Some(resources) = inherited(doc, page_id, b"Resources").and_then(|o| o.as_dict().ok()) else {
        return images;
    };
    let Some(xobjects) = resources
        .get(b"XObject")
        .ok()
        .and_then(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok())
    else {
        return images;
    };
    for (name, value) in xobjects.iter() {
        let Ok(id) = value.as_reference() else { continue };
        let is_image = doc
            .get_object(id)
            .ok()
            .and_then(|o| o.as_stream().ok())
            .and_then(|s| s.dict.get(b"Subtype").ok())
            .and_then(|s| s.as_name().ok())
            .is_some_and(|n| n == b"Image");
        if is_image {
            images.insert(name.clone(), id);
        }
    }
    images
}

fn decode_string(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn shown_text(operation: &Operation) -> String {
    let strings: Vec<&Object> = match operation.operator.as_str() {
        "Tj" | "'" => operation.operands.iter().take(1).collect(),
        "\"" => operation.operands.iter().skip(2).take(1).collect(),
        "TJ" => match operation.operands.first() {
            Some(Object::Array(items)) => items.iter().collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    strings
        .into_iter()
        .filter_map(|o| match o {
            Object::String(bytes, _) => Some(decode_string(bytes)),
            _ => None,
        })
        .collect()
}

struct TextState {
    tm: Matrix,
    tlm: Matrix,
    leading: f32,
    font_size: f32,
}

impl TextState {
    fn new() -> Self {
        Self {
            tm: IDENTITY,
            tlm: IDENTITY,
            leading: 0.0,
            font_size: 12.0,
        }
    }

    fn move_line(&mut self, tx: f32, ty: f32) {
        self.tlm = multiply(&translate(tx, ty), &self.tlm);
        self.tm = self.tlm;
    }
}

/// Project a content stream onto the layout model
pub fn layout_of(operations: &[Operation], images: &BTreeMap<Vec<u8>, ObjectId>, media: [f32; 4]) -> PageLayout {
    let [x0, y0, x1, y1] = media;
    let mut layout = PageLayout {
        width: (x1 - x0).abs(),
        height: (y1 - y0).abs(),
        ..Default::default()
    };
    // PDF space is bottom-up; the layout model is top-down
    let to_rect = |points: &[(f32, f32)]| {
        let xs = points.iter().map(|p| p.0);
        let ys = points.iter().map(|p| p.1);
        let left = xs.clone().fold(f32::MAX, f32::min) - x0;
        let right = xs.fold(f32::MIN, f32::max) - x0;
        let low = ys.clone().fold(f32::MAX, f32::min);
        let high = ys.fold(f32::MIN, f32::max);
        Rect::new(left, y1 - high, right, y1 - low)
    };

    let mut ctm = IDENTITY;
    let mut stack: Vec<Matrix> = Vec::new();
    let mut text = TextState::new();

    for (index, op) in operations.iter().enumerate() {
        match op.operator.as_str() {
            "q" => stack.push(ctm),
            "Q" => ctm = stack.pop().unwrap_or(IDENTITY),
            "cm" => {
                if let Some(m) = numbers::<6>(&op.operands) {
                    ctm = multiply(&m, &ctm);
                }
            }
            "Do" => {
                let Some(name) = op.operands.first().and_then(|o| o.as_name().ok()) else {
                    continue;
                };
                if let Some(id) = images.get(name) {
                    let corners = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)]
                        .map(|(u, v)| apply(&ctm, u, v));
                    layout.images.push(ImagePlacement {
                        key: format!("{} {}", id.0, id.1),
                        rect: to_rect(&corners),
                        op_index: index,
                    });
                }
            }
            "BT" => {
                text.tm = IDENTITY;
                text.tlm = IDENTITY;
            }
            "Tf" => {
                if let Some(size) = op.operands.get(1).and_then(number) {
                    text.font_size = size;
                }
            }
            "TL" => {
                if let Some([leading]) = numbers::<1>(&op.operands) {
                    text.leading = leading;
                }
            }
            "Td" => {
                if let Some([tx, ty]) = numbers::<2>(&op.operands) {
                    text.move_line(tx, ty);
                }
            }
            "TD" => {
                if let Some([tx, ty]) = numbers::<2>(&op.operands) {
                    text.leading = -ty;
                    text.move_line(tx, ty);
                }
            }
            "Tm" => {
                if let Some(m) = numbers::<6>(&op.operands) {
                    text.tm = m;
                    text.tlm = m;
                }
            }
            "T*" => text.move_line(0.0, -text.leading),
            "Tj" | "TJ" | "'" | "\"" => {
                if op.operator == "'" || op.operator == "\"" {
                    text.move_line(0.0, -text.leading);
                }
                let shown = shown_text(op);
                if shown.is_empty() {
                    continue;
                }
                let advance = shown.chars().count() as f32 * text.font_size * GLYPH_ADVANCE;
                let trm = multiply(&text.tm, &ctm);
                let descent = -0.2 * text.font_size;
                let ascent = 0.8 * text.font_size;
                let corners = [(0.0, descent), (advance, descent), (0.0, ascent), (advance, ascent)]
                    .map(|(u, v)| apply(&trm, u, v));
                layout.texts.push(TextFragment {
                    text: shown,
                    rect: to_rect(&corners),
                    op_index: index,
                });
                text.tm = multiply(&translate(advance, 0.0), &text.tm);
            }
            _ => {}
        }
    }
    layout
}

/// Loaded document with its pages in order
pub struct PdfDocument {
    doc: Document,
    pages: Vec<ObjectId>,
}

impl PdfDocument {
    pub fn load(path: &std::path::Path) -> Result<Self, lopdf::Error> {
        let doc = Document::load(path)?;
        let pages = doc.get_pages().into_values().collect();
        Ok(Self { doc, pages })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn operations(&self, page_id: ObjectId) -> Result<Vec<Operation>, lopdf::Error> {
        let data = self.doc.get_page_content(page_id)?;
        Ok(Content::decode(&data)?.operations)
    }

    /// Layout of every page; pages whose content cannot be read come back empty
    pub fn layouts(&self) -> Vec<PageLayout> {
        self.pages
            .iter()
            .map(|&page_id| {
                let media = media_box(&self.doc, page_id);
                match self.operations(page_id) {
                    Ok(ops) => layout_of(&ops, &page_images(&self.doc, page_id), media),
                    Err(e) => {
                        debug!(page = ?page_id, error = %e, "Unreadable page content");
                        PageLayout::default()
                    }
                }
            })
            .collect()
    }

    /// Remove every planned operation, one rewrite per page
    pub fn apply(&mut self, plan: &RedactionPlan) -> Result<usize, lopdf::Error> {
        let mut modified = 0;
        for page_plan in &plan.pages {
            let Some(&page_id) = self.pages.get(page_plan.page) else {
                continue;
            };
            let remove = page_plan.ops();
            let kept: Vec<Operation> = self
                .operations(page_id)?
                .into_iter()
                .enumerate()
                .flat_map(|(index, op)| {
                    if remove.contains(&index) {
                        line_state_of(op)
                    } else {
                        vec![op]
                    }
                })
                .collect();
            let encoded = Content { operations: kept }.encode()?;
            self.doc.change_page_content(page_id, encoded)?;
            modified += 1;
        }
        self.drop_unused_images(&plan.header_images);
        Ok(modified)
    }

    /// Delete header images no page draws anymore
    fn drop_unused_images(&mut self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let mut still_drawn: HashSet<ObjectId> = HashSet::new();
        let mut named: Vec<(ObjectId, Vec<u8>, ObjectId)> = Vec::new();
        for &page_id in &self.pages {
            let images = page_images(&self.doc, page_id);
            if let Ok(ops) = self.operations(page_id) {
                for op in ops.iter().filter(|op| op.operator == "Do") {
                    if let Some(id) = op
                        .operands
                        .first()
                        .and_then(|o| o.as_name().ok())
                        .and_then(|n| images.get(n))
                    {
                        still_drawn.insert(*id);
                    }
                }
            }
            for (name, id) in images {
                named.push((page_id, name, id));
            }
        }

        let mut removed: HashSet<ObjectId> = HashSet::new();
        for (page_id, name, id) in named {
            let key = format!("{} {}", id.0, id.1);
            if still_drawn.contains(&id) || !keys.contains(&key) {
                continue;
            }
            if let Some(xobjects) = self.xobjects_mut(page_id) {
                xobjects.remove(&name);
            }
            removed.insert(id);
        }
        for id in removed {
            self.doc.objects.remove(&id);
            debug!(object = ?id, "Removed header image object");
        }
    }

    /// The XObject dictionary a page resolves to, for in-place edits
    fn xobjects_mut(&mut self, page_id: ObjectId) -> Option<&mut Dictionary> {
        // Find where the dictionary lives before borrowing mutably
        let mut owner = page_id;
        loop {
            let dict = self.doc.get_dictionary(owner).ok()?;
            if dict.has(b"Resources") {
                break;
            }
            owner = dict.get(b"Parent").ok()?.as_reference().ok()?;
        }
        let resources = self.doc.get_dictionary(owner).ok()?.get(b"Resources").ok()?;
        let (resources_owner, inline_resources) = match resources {
            Object::Reference(id) => (*id, false),
            _ => (owner, true),
        };
        let resources_dict = if inline_resources {
            self.doc.get_dictionary(owner).ok()?.get(b"Resources").ok()?.as_dict().ok()?
        } else {
            self.doc.get_dictionary(resources_owner).ok()?
        };
        let xobject_ref = match resources_dict.get(b"XObject").ok()? {
            Object::Reference(id) => Some(*id),
            _ => None,
        };

        if let Some(id) = xobject_ref {
            return self.doc.get_dictionary_mut(id).ok();
        }
        let holder = self.doc.get_dictionary_mut(resources_owner).ok()?;
        let resources = if inline_resources {
            holder.get_mut(b"Resources").ok()?.as_dict_mut().ok()?
        } else {
            holder
        };
        resources.get_mut(b"XObject").ok()?.as_dict_mut().ok()
    }

    pub fn save(&mut self, path: &std::path::Path) -> Result<(), lopdf::Error> {
        self.doc.save(path)?;
        Ok(())
    }
}

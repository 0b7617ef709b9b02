//! Small generated PDFs
//!
//! Letter-size pages with an optional shared header logo and an optional
//! download stamp above a line of body text.

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::path::Path;

pub const PAGE_HEIGHT: i64 = 792;

/// What to draw on one test page
#[derive(Clone, Copy, Default)]
pub struct PageSpec {
    /// (top offset, height) of the shared logo, in points from the top
    pub logo: Option<(i64, i64)>,
    /// Draw a "Downloaded from" stamp 20pt below the top edge
    pub stamp: bool,
}

pub fn write_pdf(path: &Path, pages: &[PageSpec]) {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 1,
            "Height" => 1,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        vec![0],
    ));
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
        "XObject" => dictionary! { "Im1" => image_id },
    });

    let mut kids = Vec::new();
    for spec in pages {
        let mut operations = Vec::new();
        if let Some((top, height)) = spec.logo {
            operations.extend([
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        Object::Integer(100),
                        Object::Integer(0),
                        Object::Integer(0),
                        Object::Integer(height),
                        Object::Integer(40),
                        Object::Integer(PAGE_HEIGHT - top - height),
                    ],
                ),
                Operation::new("Do", vec![Object::Name(b"Im1".to_vec())]),
                Operation::new("Q", vec![]),
            ]);
        }
        if spec.stamp {
            operations.extend([
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), Object::Integer(9)]),
                Operation::new(
                    "Td",
                    vec![Object::Integer(200), Object::Integer(PAGE_HEIGHT - 20)],
                ),
                Operation::new("Tj", vec![Object::string_literal("Downloaded from iranpaper.ir")]),
                Operation::new("ET", vec![]),
            ]);
        }
        operations.extend([
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), Object::Integer(12)]),
            Operation::new("Td", vec![Object::Integer(72), Object::Integer(400)]),
            Operation::new("Tj", vec![Object::string_literal("Body text")]),
            Operation::new("ET", vec![]),
        ]);

        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().expect("content encodes")));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(Object::Reference(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), Object::Integer(PAGE_HEIGHT)],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.save(path).expect("fixture PDF written");
}

//! Sanitizer behavior on whole documents
//!
//! Covers the decisions that depend on the document as a whole: how often a
//! logo must recur, first-page handling, forced rewrites and unreadable input.

use docrunner::config::SanitizerSection;
use docrunner::sanitizer::pdf::PdfDocument;
use docrunner::sanitizer::{sanitize_file, SanitizeError};
use docrunner::testing::fixtures::{write_pdf, PageSpec};
use tempfile::TempDir;

const LOGO: PageSpec = PageSpec {
    logo: Some((8, 40)),
    stamp: false,
};

const PLAIN: PageSpec = PageSpec {
    logo: None,
    stamp: false,
};

fn image_counts(path: &std::path::Path) -> Vec<usize> {
    PdfDocument::load(path)
        .unwrap()
        .layouts()
        .iter()
        .map(|page| page.images.len())
        .collect()
}

#[test]
fn test_rare_logo_is_kept() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("figure.pdf");
    let mut pages = vec![PLAIN; 10];
    pages[3] = LOGO;
    pages[7] = LOGO;
    write_pdf(&path, &pages);

    let outcome = sanitize_file(&path, &SanitizerSection::default()).unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.images_removed, 0);
    assert_eq!(image_counts(&path).iter().sum::<usize>(), 2);
}

#[test]
fn test_logo_on_most_pages_is_removed_everywhere_it_appears() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("paper.pdf");
    let mut pages = vec![LOGO; 8];
    pages[5] = PLAIN;
    write_pdf(&path, &pages);

    let outcome = sanitize_file(&path, &SanitizerSection::default()).unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.pages, 8);
    assert_eq!(outcome.pages_modified, 7);
    assert_eq!(outcome.images_removed, 7);
    assert!(image_counts(&path).iter().all(|count| *count == 0));
}

#[test]
fn test_first_page_can_be_left_alone() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cover.pdf");
    write_pdf(
        &path,
        &[
            PageSpec {
                logo: Some((8, 40)),
                stamp: true,
            },
            LOGO,
            LOGO,
            LOGO,
        ],
    );
    let params = SanitizerSection {
        include_first_page: false,
        ..Default::default()
    };

    let outcome = sanitize_file(&path, &params).unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.texts_removed, 0);
    assert_eq!(image_counts(&path), vec![1, 0, 0, 0]);

    let first = &PdfDocument::load(&path).unwrap().layouts()[0];
    assert!(first.texts.iter().any(|t| t.text.contains("Downloaded from")));
}

#[test]
fn test_disabled_keywords_keep_stamps() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stamped.pdf");
    write_pdf(
        &path,
        &[PageSpec {
            logo: None,
            stamp: true,
        }],
    );
    let params = SanitizerSection {
        keywords: Vec::new(),
        ..Default::default()
    };

    let outcome = sanitize_file(&path, &params).unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.texts_removed, 0);
}

#[test]
fn test_force_write_rewrites_clean_document() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("clean.pdf");
    write_pdf(&path, &[PLAIN; 2]);
    let params = SanitizerSection {
        force_write: true,
        ..Default::default()
    };

    let outcome = sanitize_file(&path, &params).unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.pages, 2);
    assert_eq!(PdfDocument::load(&path).unwrap().page_count(), 2);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".sanitizing"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_unreadable_document_is_an_error_and_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("not-a.pdf");
    std::fs::write(&path, b"<html>login required</html>").unwrap();

    let result = sanitize_file(&path, &SanitizerSection::default());
    assert!(matches!(result, Err(SanitizeError::Pdf(_))));
    assert_eq!(
        std::fs::read(&path).unwrap(),
        b"<html>login required</html>"
    );
}

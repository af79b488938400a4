//! Report Extractor: per-page PDF text → patient info + lab results.
//!
//! Extraction is a strategy behind [`ExtractionStrategy`] so the regex
//! rules can be swapped for template- or model-based parsing without
//! touching the pipeline. [`PatternExtractor`] implements the line rules
//! of the supported lab vendor's report layout; other layouts may produce
//! false positives or negatives and are explicitly out of warranty.

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Result, ServiceError};
use crate::models::{LabResults, NOT_FOUND, PatientInfo};

/// Extract the ordered per-page text of an uploaded PDF.
///
/// Runs the PDF parser on a blocking thread. Pages with no extractable
/// text (scanned images) come back empty and simply contribute nothing
/// downstream.
pub async fn extract_pages(bytes: Vec<u8>) -> Result<Vec<String>> {
    let pages = tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem_by_pages(&bytes)
    })
    .await
    .map_err(|e| ServiceError::Pdf(format!("extraction task failed: {e}")))?
    .map_err(|e| ServiceError::Pdf(format!("failed to read PDF text: {e}")))?;

    info!(pages = pages.len(), "extracted PDF page text");
    Ok(pages)
}

/// Page text in, structured fields out.
pub trait ExtractionStrategy: Send + Sync {
    fn patient_info(&self, pages: &[String]) -> PatientInfo;
    fn lab_results(&self, pages: &[String]) -> LabResults;
}

/// Line-oriented pattern rules for pathology reports.
pub struct PatternExtractor {
    name_re: Regex,
    age_re: Regex,
    weight_re: Regex,
    height_re: Regex,
    result_re: Regex,
    denylist_re: Regex,
}

impl PatternExtractor {
    pub fn new() -> Self {
        Self {
            // Captures stay on the labelled line; a class with `\s` would
            // run across the newline into the next label.
            name_re: Regex::new(r"Patient Name[ \t]*:[ \t]*([\w. ]+)").expect("Invalid regex"),
            age_re: Regex::new(r"Age/Gender[ \t]*:[ \t]*([\w/ ]+)").expect("Invalid regex"),
            weight_re: Regex::new(r"Weight\s*:\s*([\d.]+)").expect("Invalid regex"),
            height_re: Regex::new(r"Height\s*:\s*([\d.]+)").expect("Invalid regex"),
            result_re: Regex::new(r"^(\w[\w\s,]*)\s+(\d+\.?\d*)").expect("Invalid regex"),
            // Boilerplate lines that also look like label+number results:
            // page footers and the vendor's glycemic-control descriptors.
            denylist_re: Regex::new(
                r"Page \d+ of|\bAs per\b|EXCELLENT CONTROL|FAIR TO GOOD CONTROL|UNSATISFACTORY CONTROL|Control by American Diabetes Association guidelines",
            )
            .expect("Invalid regex"),
        }
    }
}

impl Default for PatternExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionStrategy for PatternExtractor {
    /// Scans pages in order and stops at the first page where both the
    /// name and age patterns match. Weight and height are taken from that
    /// same page when present, otherwise recorded as the sentinel.
    fn patient_info(&self, pages: &[String]) -> PatientInfo {
        for page in pages {
            let name = self.name_re.captures(page);
            let age = self.age_re.captures(page);
            if let (Some(name), Some(age)) = (name, age) {
                let capture = |re: &Regex| {
                    re.captures(page)
                        .map(|c| c[1].trim().to_string())
                        .unwrap_or_else(|| NOT_FOUND.to_string())
                };
                return PatientInfo {
                    name: Some(name[1].trim().to_string()),
                    age: Some(age[1].trim().to_string()),
                    weight: Some(capture(&self.weight_re)),
                    height: Some(capture(&self.height_re)),
                };
            }
        }
        debug!("no page matched both name and age patterns");
        PatientInfo::default()
    }

    /// Every line of every page; a line qualifies when it starts with a
    /// word-like label followed by a numeric value and the label is not
    /// known boilerplate. The last occurrence of a label wins, since some
    /// reports repeat a label once as a header and once as data.
    fn lab_results(&self, pages: &[String]) -> LabResults {
        let mut results = LabResults::new();
        for page in pages {
            for line in page.lines() {
                if let Some(captures) = self.result_re.captures(line) {
                    let label = captures[1].trim().to_string();
                    if self.denylist_re.is_match(&label) {
                        continue;
                    }
                    results.insert(label, captures[2].trim().to_string());
                }
            }
        }
        results
    }
}

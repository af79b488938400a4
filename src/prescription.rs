//! Prescription Renderer: lays the patient block and the three analysis
//! sections onto letter-size pages, each drawn over a full-page background
//! image when one is configured.

use printpdf::*;
use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, ServiceError};
use crate::models::{AnalysisBundle, NOT_FOUND, PatientInfo};

// US letter.
const PAGE_WIDTH_MM: f32 = 215.9;
const PAGE_HEIGHT_MM: f32 = 279.4;
const MARGIN_LEFT_MM: f32 = 20.0;
const TOP_MM: f32 = 266.0;
const BOTTOM_MM: f32 = 20.0;
const WRAP_COLS: usize = 95;

pub struct PrescriptionRenderer {
    output_dir: PathBuf,
    background: PathBuf,
}

impl PrescriptionRenderer {
    pub fn new(output_dir: impl Into<PathBuf>, background: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            background: background.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Render the prescription and return the output path. A file for the
    /// same patient name overwrites the previous one.
    pub fn render(&self, patient: &PatientInfo, bundle: &AnalysisBundle) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| ServiceError::Pdf(format!("cannot create output dir: {e}")))?;
        let path = self.output_dir.join(prescription_file_name(patient));

        let background = match std::fs::read(&self.background) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(path = %self.background.display(), "no background image: {e}");
                None
            }
        };

        let (doc, page, layer) =
            PdfDocument::new("Prescription", Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "Layer 1");
        let font = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|e| ServiceError::Pdf(format!("font error: {e}")))?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|e| ServiceError::Pdf(format!("font error: {e}")))?;

        {
            let mut writer = PageWriter {
                doc: &doc,
                background: background.as_deref(),
                layer: doc.get_page(page).get_layer(layer),
                y: TOP_MM,
            };
            writer.draw_background();

            writer.line("Prescription", 16.0, &bold, 10.0);
            writer.space(4.0);

            let field = |v: &Option<String>| v.as_deref().unwrap_or(NOT_FOUND).to_string();
            writer.line(&format!("Patient: {}", field(&patient.name)), 10.0, &font, 5.0);
            writer.line(&format!("Age: {}", field(&patient.age)), 10.0, &font, 5.0);
            writer.line(&format!("Height: {}", field(&patient.height)), 10.0, &font, 5.0);
            writer.line(&format!("Weight: {}", field(&patient.weight)), 10.0, &font, 5.0);

            writer.section("Diagnosis:", &bundle.analysis, &bold, &font);
            writer.section("Recommendations:", &bundle.recommendations, &bold, &font);
            writer.section("Medications:", &bundle.medications, &bold, &font);
        }

        let file = File::create(&path)
            .map_err(|e| ServiceError::Pdf(format!("cannot create {}: {e}", path.display())))?;
        doc.save(&mut BufWriter::new(file))
            .map_err(|e| ServiceError::Pdf(format!("pdf save error: {e}")))?;

        Ok(path)
    }
}

/// Patient name with spaces replaced by `_`, or a generic placeholder.
pub fn prescription_file_name(patient: &PatientInfo) -> String {
    let name = patient.name.as_deref().unwrap_or("Patient").replace(' ', "_");
    format!("{name}_prescription.pdf")
}

struct PageWriter<'a> {
    doc: &'a PdfDocumentReference,
    background: Option<&'a [u8]>,
    layer: PdfLayerReference,
    y: f32,
}

impl PageWriter<'_> {
    fn line(&mut self, text: &str, size: f32, font: &IndirectFontRef, step_mm: f32) {
        if self.y < BOTTOM_MM {
            self.new_page();
        }
        self.layer
            .use_text(text, size, Mm(MARGIN_LEFT_MM), Mm(self.y), font);
        self.y -= step_mm;
    }

    fn space(&mut self, mm: f32) {
        self.y -= mm;
    }

    /// Heading plus body text. Embedded newlines in the body become hard
    /// breaks; long lines word-wrap; overflow paginates.
    fn section(&mut self, heading: &str, body: &str, bold: &IndirectFontRef, font: &IndirectFontRef) {
        self.space(4.0);
        self.line(heading, 12.0, bold, 6.0);
        for paragraph in body.split('\n') {
            if paragraph.trim().is_empty() {
                self.space(2.5);
                continue;
            }
            for line in wrap_text(paragraph, WRAP_COLS) {
                self.line(&line, 9.0, font, 4.5);
            }
        }
    }

    fn new_page(&mut self) {
        let (page, layer) = self
            .doc
            .add_page(Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "Layer 1");
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.y = TOP_MM;
        self.draw_background();
    }

    /// Stretches the background to the full page (aspect ratio is not
    /// preserved; the asset is a page template). Drawn before any text so
    /// content sits on top.
    fn draw_background(&self) {
        let Some(bytes) = self.background else {
            return;
        };
        let decoder = match printpdf::image_crate::codecs::png::PngDecoder::new(Cursor::new(bytes)) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("background image is not a readable PNG: {e}");
                return;
            }
        };
        let image = match Image::try_from(decoder) {
            Ok(image) => image,
            Err(e) => {
                warn!("background image could not be embedded: {e}");
                return;
            }
        };

        // Native placement is at 300 dpi; scale that up to the page box.
        let native_w_mm = image.image.width.0 as f32 * 25.4 / 300.0;
        let native_h_mm = image.image.height.0 as f32 * 25.4 / 300.0;
        image.add_to_layer(
            self.layer.clone(),
            ImageTransform {
                translate_x: Some(Mm(0.0)),
                translate_y: Some(Mm(0.0)),
                scale_x: Some(PAGE_WIDTH_MM / native_w_mm),
                scale_y: Some(PAGE_HEIGHT_MM / native_h_mm),
                ..Default::default()
            },
        );
    }
}

fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.len() + word.len() + 1 > max_chars && !current.is_empty() {
            lines.push(current.clone());
            current.clear();
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

use std::collections::BTreeMap;

use lopdf::{content::Content, Dictionary, Document, Encoding, Object, ObjectId, Stream};
use shared::domain::{BoundingBox, RawBlock};
use tracing::debug;

use crate::error::ExtractError;

/// US Letter, used when neither the page nor its ancestors declare a MediaBox.
const DEFAULT_MEDIA_BOX: [f64; 4] = [0.0, 0.0, 612.0, 792.0];
/// Average glyph advance as a fraction of the font size. Glyph widths are not
/// read from font programs, so block extents are estimates.
const GLYPH_WIDTH_RATIO: f64 = 0.5;
/// TJ adjustments beyond this many thousandths of an em are rendered as a space.
const WORD_GAP_THOUSANDTHS: f64 = 200.0;
/// Nesting limit for Form XObjects drawn from inside other forms.
const MAX_FORM_DEPTH: usize = 8;

/// Text of the first page, grouped by PDF text object.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub width: f64,
    pub height: f64,
    pub blocks: Vec<PageBlock>,
}

#[derive(Debug, Clone)]
pub struct PageBlock {
    pub lines: Vec<String>,
    pub bbox: BoundingBox,
}

impl ParsedPage {
    pub fn text_blocks(&self) -> Vec<RawBlock> {
        self.blocks
            .iter()
            .filter_map(|block| {
                let text = block.lines.join(" ").trim().to_string();
                (!text.is_empty()).then_some(RawBlock {
                    text,
                    bbox: block.bbox,
                })
            })
            .collect()
    }

    pub fn lines(&self) -> Vec<RawBlock> {
        self.blocks
            .iter()
            .flat_map(|block| {
                block
                    .lines
                    .iter()
                    .map(|line| line.trim())
                    .filter(|line| !line.is_empty())
                    .map(move |line| RawBlock {
                        text: line.to_string(),
                        bbox: block.bbox,
                    })
            })
            .collect()
    }

    pub fn plain_text(&self) -> String {
        self.blocks
            .iter()
            .map(|block| block.lines.join("\n"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

pub struct PdfParser;

impl PdfParser {
    pub fn parse(pdf_bytes: &[u8]) -> Result<ParsedPage, ExtractError> {
        let doc = Document::load_mem(pdf_bytes)?;
        let page_id = doc
            .get_pages()
            .into_values()
            .next()
            .ok_or(ExtractError::EmptyDocument)?;

        let [mx0, my0, mx1, my1] = media_box(&doc, page_id);
        let width = (mx1 - mx0).abs().max(1.0);
        let height = (my1 - my0).abs().max(1.0);

        let content = Content::decode(&doc.get_page_content(page_id)?)?;
        let mut interpreter = TextInterpreter::new(&doc, Resources::for_page(&doc, page_id));
        interpreter.run(&content);

        let blocks: Vec<PageBlock> = interpreter
            .finish()
            .into_iter()
            .map(|object| PageBlock {
                bbox: BoundingBox::new(
                    clamp_unit((object.min_x - mx0) / width),
                    clamp_unit((my1 - object.max_y) / height),
                    clamp_unit((object.max_x - mx0) / width),
                    clamp_unit((my1 - object.min_y) / height),
                ),
                lines: object.lines,
            })
            .collect();
        debug!(blocks = blocks.len(), width, height, "pdf: first page parsed");

        Ok(ParsedPage {
            width,
            height,
            blocks,
        })
    }

    pub fn extract_text_blocks(pdf_bytes: &[u8]) -> Result<Vec<RawBlock>, ExtractError> {
        Ok(Self::parse(pdf_bytes)?.text_blocks())
    }

    pub fn extract_lines(pdf_bytes: &[u8]) -> Result<Vec<RawBlock>, ExtractError> {
        Ok(Self::parse(pdf_bytes)?.lines())
    }

    pub fn extract_plain_text(pdf_bytes: &[u8]) -> Result<String, ExtractError> {
        Ok(Self::parse(pdf_bytes)?.plain_text())
    }
}

fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn media_box(doc: &Document, page_id: ObjectId) -> [f64; 4] {
    let mut current = doc.get_dictionary(page_id).ok();
    while let Some(dict) = current {
        if let Ok(raw) = dict.get(b"MediaBox") {
            if let Ok(values) = resolve(doc, raw).as_array() {
                let numbers: Vec<f64> = values.iter().filter_map(|v| number(resolve(doc, v))).collect();
                if let [x0, y0, x1, y1] = numbers[..] {
                    return [x0, y0, x1, y1];
                }
            }
        }
        current = dict
            .get(b"Parent")
            .and_then(|parent| parent.as_reference())
            .ok()
            .and_then(|id| doc.get_dictionary(id).ok());
    }
    DEFAULT_MEDIA_BOX
}

fn resolve<'a>(doc: &'a Document, object: &'a Object) -> &'a Object {
    match object {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(object),
        other => other,
    }
}

fn number(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(f64::from(*r)),
        _ => None,
    }
}

/// Fonts and XObjects visible to a content stream.
struct Resources<'a> {
    fonts: BTreeMap<Vec<u8>, Encoding<'a>>,
    xobjects: Vec<&'a Dictionary>,
}

impl<'a> Resources<'a> {
    /// Page resources, including those inherited from the page tree.
    fn for_page(doc: &'a Document, page_id: ObjectId) -> Self {
        let fonts = doc
            .get_page_fonts(page_id)
            .map(|fonts| {
                fonts
                    .into_iter()
                    .filter_map(|(name, font)| Some((name, font_encoding(doc, font)?)))
                    .collect()
            })
            .unwrap_or_default();

        let mut xobjects = Vec::new();
        if let Ok((own, inherited)) = doc.get_page_resources(page_id) {
            let dicts = own
                .into_iter()
                .chain(inherited.into_iter().filter_map(|id| doc.get_dictionary(id).ok()));
            for resources in dicts {
                if let Ok(dict) = resources.get_deref(b"XObject", doc).and_then(Object::as_dict) {
                    xobjects.push(dict);
                }
            }
        }

        Self { fonts, xobjects }
    }

    /// Resources declared on a Form XObject. Missing entries fall through to
    /// the enclosing scope.
    fn for_form(doc: &'a Document, form: &'a Stream) -> Self {
        let Ok(resources) = form.dict.get_deref(b"Resources", doc).and_then(Object::as_dict) else {
            return Self {
                fonts: BTreeMap::new(),
                xobjects: Vec::new(),
            };
        };

        let fonts = resources
            .get_deref(b"Font", doc)
            .and_then(Object::as_dict)
            .map(|fonts| {
                fonts
                    .iter()
                    .filter_map(|(name, font)| {
                        let font = resolve(doc, font).as_dict().ok()?;
                        Some((name.clone(), font_encoding(doc, font)?))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let xobjects = resources
            .get_deref(b"XObject", doc)
            .and_then(Object::as_dict)
            .into_iter()
            .collect();

        Self { fonts, xobjects }
    }
}

/// The encoding a font declares, through `/Encoding` or `/ToUnicode`.
/// Fonts declaring neither keep the byte-per-character fallback.
fn font_encoding<'a>(doc: &'a Document, font: &'a Dictionary) -> Option<Encoding<'a>> {
    if !font.type_is(b"Font") || (!font.has(b"Encoding") && !font.has(b"ToUnicode")) {
        return None;
    }
    match font.get_font_encoding(doc) {
        Ok(Encoding::SimpleEncoding(name)) => {
            debug!(encoding = name, "pdf: unsupported font encoding");
            None
        }
        Ok(encoding) => Some(encoding),
        Err(e) => {
            debug!(error = %e, "pdf: font encoding did not resolve");
            None
        }
    }
}

/// Decodes a PDF string operand: UTF-16BE when it carries a BOM, otherwise
/// one byte per character.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|b| char::from(*b)).collect()
}

/// Affine matrix `[a b c d e f]` in PDF row-vector convention.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix([f64; 6]);

impl Matrix {
    const IDENTITY: Self = Self([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    fn translate(tx: f64, ty: f64) -> Self {
        Self([1.0, 0.0, 0.0, 1.0, tx, ty])
    }

    fn from_operands(operands: &[Object]) -> Option<Self> {
        let values: Vec<f64> = operands.iter().filter_map(number).collect();
        match values[..] {
            [a, b, c, d, e, f] => Some(Self([a, b, c, d, e, f])),
            _ => None,
        }
    }

    /// `self × other`
    fn then(&self, other: &Self) -> Self {
        let [a1, b1, c1, d1, e1, f1] = self.0;
        let [a2, b2, c2, d2, e2, f2] = other.0;
        Self([
            a1 * a2 + b1 * c2,
            a1 * b2 + b1 * d2,
            c1 * a2 + d1 * c2,
            c1 * b2 + d1 * d2,
            e1 * a2 + f1 * c2 + e2,
            e1 * b2 + f1 * d2 + f2,
        ])
    }

    fn origin(&self) -> (f64, f64) {
        (self.0[4], self.0[5])
    }

    fn scale_x(&self) -> f64 {
        self.0[0].hypot(self.0[1])
    }

    fn scale_y(&self) -> f64 {
        self.0[2].hypot(self.0[3])
    }
}

#[derive(Debug)]
struct TextObject {
    lines: Vec<String>,
    baseline: Option<f64>,
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
}

impl Default for TextObject {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            baseline: None,
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }
}

impl TextObject {
    fn push(&mut self, text: &str, x: f64, y: f64, width: f64, height: f64) {
        let same_line = self
            .baseline
            .is_some_and(|baseline| (baseline - y).abs() <= height / 2.0);
        match self.lines.last_mut() {
            Some(line) if same_line => line.push_str(text),
            _ => self.lines.push(text.to_string()),
        }
        self.baseline = Some(y);
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x + width);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y + height);
    }

    fn push_space(&mut self) {
        if let Some(line) = self.lines.last_mut() {
            if !line.ends_with(' ') {
                line.push(' ');
            }
        }
    }

    fn has_text(&self) -> bool {
        self.lines.iter().any(|line| !line.trim().is_empty())
    }
}

/// Walks content-stream operators, tracking just enough graphics and text
/// state to place each shown string on the page.
struct TextInterpreter<'a> {
    doc: &'a Document,
    /// Innermost scope last.
    scopes: Vec<Resources<'a>>,
    font: Option<Vec<u8>>,
    ctm: Matrix,
    saved: Vec<Matrix>,
    tm: Matrix,
    tlm: Matrix,
    font_size: f64,
    leading: f64,
    current: Option<TextObject>,
    finished: Vec<TextObject>,
}

impl<'a> TextInterpreter<'a> {
    fn new(doc: &'a Document, page: Resources<'a>) -> Self {
        Self {
            doc,
            scopes: vec![page],
            font: None,
            ctm: Matrix::IDENTITY,
            saved: Vec::new(),
            tm: Matrix::IDENTITY,
            tlm: Matrix::IDENTITY,
            font_size: 12.0,
            leading: 0.0,
            current: None,
            finished: Vec::new(),
        }
    }

    fn run(&mut self, content: &Content) {
        for operation in &content.operations {
            self.apply(&operation.operator, &operation.operands);
        }
    }

    fn apply(&mut self, operator: &str, operands: &[Object]) {
        match operator {
            "q" => self.saved.push(self.ctm),
            "Q" => {
                if let Some(ctm) = self.saved.pop() {
                    self.ctm = ctm;
                }
            }
            "cm" => {
                if let Some(m) = Matrix::from_operands(operands) {
                    self.ctm = m.then(&self.ctm);
                }
            }
            "BT" => {
                self.flush();
                self.tm = Matrix::IDENTITY;
                self.tlm = Matrix::IDENTITY;
                self.current = Some(TextObject::default());
            }
            "ET" => self.flush(),
            "Tf" => {
                if let Some(Ok(name)) = operands.first().map(Object::as_name) {
                    self.font = Some(name.to_vec());
                }
                if let Some(size) = operands.get(1).and_then(number) {
                    self.font_size = size;
                }
            }
            "TL" => {
                if let Some(leading) = operands.first().and_then(number) {
                    self.leading = leading;
                }
            }
            "Td" | "TD" => {
                if let [tx, ty] = operands {
                    let (Some(tx), Some(ty)) = (number(tx), number(ty)) else {
                        return;
                    };
                    if operator == "TD" {
                        self.leading = -ty;
                    }
                    self.move_line(tx, ty);
                }
            }
            "Tm" => {
                if let Some(m) = Matrix::from_operands(operands) {
                    self.tm = m;
                    self.tlm = m;
                }
            }
            "T*" => self.move_line(0.0, -self.leading),
            "Tj" => {
                if let Some(Object::String(bytes, _)) = operands.first() {
                    self.show(bytes);
                }
            }
            "'" => {
                self.move_line(0.0, -self.leading);
                if let Some(Object::String(bytes, _)) = operands.first() {
                    self.show(bytes);
                }
            }
            "\"" => {
                self.move_line(0.0, -self.leading);
                if let Some(Object::String(bytes, _)) = operands.get(2) {
                    self.show(bytes);
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = operands.first() {
                    for item in items {
                        match item {
                            Object::String(bytes, _) => self.show(bytes),
                            other => {
                                if let Some(adjust) = number(other) {
                                    self.kern(adjust);
                                }
                            }
                        }
                    }
                }
            }
            "Do" => {
                if let Some(Ok(name)) = operands.first().map(Object::as_name) {
                    self.draw_form(name);
                }
            }
            _ => {}
        }
    }

    fn xobject(&self, name: &[u8]) -> Option<&'a Stream> {
        let doc = self.doc;
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.xobjects.iter().copied())
            .find_map(|dict| dict.get_deref(name, doc).and_then(Object::as_stream).ok())
    }

    fn encoding(&self) -> Option<&Encoding<'a>> {
        let font = self.font.as_deref()?;
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.fonts.get(font))
    }

    /// Runs a Form XObject's content under its `/Matrix`, leaving the
    /// graphics state as it was. Image XObjects carry no text and are skipped.
    fn draw_form(&mut self, name: &[u8]) {
        let Some(form) = self.xobject(name) else {
            debug!(name = %String::from_utf8_lossy(name), "pdf: unknown XObject");
            return;
        };
        let is_form = form
            .dict
            .get(b"Subtype")
            .and_then(Object::as_name)
            .is_ok_and(|subtype| subtype == b"Form");
        if !is_form {
            return;
        }
        // The page itself is the first scope.
        if self.scopes.len() > MAX_FORM_DEPTH {
            debug!(depth = self.scopes.len(), "pdf: Form XObject nesting too deep");
            return;
        }

        let content = match form.get_plain_content().and_then(|bytes| Content::decode(&bytes)) {
            Ok(content) => content,
            Err(e) => {
                debug!(error = %e, "pdf: unreadable Form XObject");
                return;
            }
        };

        let ctm = self.ctm;
        let saved = self.saved.len();
        let font = self.font.clone();
        if let Some(matrix) = form
            .dict
            .get_deref(b"Matrix", self.doc)
            .and_then(Object::as_array)
            .ok()
            .and_then(|values| Matrix::from_operands(values))
        {
            self.ctm = matrix.then(&self.ctm);
        }

        self.scopes.push(Resources::for_form(self.doc, form));
        self.run(&content);
        self.scopes.pop();

        self.saved.truncate(saved);
        self.ctm = ctm;
        self.font = font;
    }

    fn move_line(&mut self, tx: f64, ty: f64) {
        self.tlm = Matrix::translate(tx, ty).then(&self.tlm);
        self.tm = self.tlm;
    }

    fn kern(&mut self, thousandths: f64) {
        if thousandths < -WORD_GAP_THOUSANDTHS {
            if let Some(object) = self.current.as_mut() {
                object.push_space();
            }
        }
        let advance = -thousandths / 1000.0 * self.font_size;
        self.tm = Matrix::translate(advance, 0.0).then(&self.tm);
    }

    fn show(&mut self, bytes: &[u8]) {
        let text = self
            .encoding()
            .and_then(|encoding| Document::decode_text(encoding, bytes).ok())
            .unwrap_or_else(|| decode_pdf_string(bytes));
        let advance = text.chars().count() as f64 * self.font_size * GLYPH_WIDTH_RATIO;
        let rendering = self.tm.then(&self.ctm);
        let (x, y) = rendering.origin();
        let width = advance * rendering.scale_x();
        let height = self.font_size * rendering.scale_y();

        self.current
            .get_or_insert_with(TextObject::default)
            .push(&text, x, y, width, height);
        self.tm = Matrix::translate(advance, 0.0).then(&self.tm);
    }

    fn flush(&mut self) {
        if let Some(object) = self.current.take() {
            if object.has_text() {
                self.finished.push(object);
            }
        }
    }

    fn finish(mut self) -> Vec<TextObject> {
        self.flush();
        self.finished
    }
}

#[cfg(test)]
#[path = "tests/pdf_parser_tests.rs"]
pub(crate) mod tests;

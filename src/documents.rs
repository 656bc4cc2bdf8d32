//! Document conversions behind `/api/convert-file`.
//!
//! PDF text comes from `lopdf`. Word and Excel files are Office Open XML
//! packages, read and written through `zip`, with the handful of XML parts
//! we touch generated or scanned directly.

use std::io::{Cursor, Read, Write};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use zip::ZipArchive;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Excel's last column, `XFD`.
pub const MAX_COLUMNS: usize = 16_384;

/// Upper bound on cells held in memory while padding a sheet to a rectangle.
const MAX_CELLS: usize = 4_000_000;

/// Upper bound on one decompressed package part.
const MAX_PART_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Conversion from {from} to {to} is not yet supported.")]
    Unsupported { from: String, to: String },
    #[error("PDF could not be read: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("Office package could not be read or written: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Spreadsheet is malformed: {0}")]
    Sheet(String),
    #[error("XML could not be parsed: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("XML is nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("JSON rendering failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// The conversions the endpoint knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    PdfToText,
    PdfToWord,
    TextToWord,
    WordToText,
    CsvToSheet,
    SheetToCsv,
    XmlToText,
    XmlToWord,
}

impl Conversion {
    /// Look up a `from`/`to` pair. Codes are case-insensitive.
    pub fn plan(from: &str, to: &str) -> Result<Self, DocumentError> {
        let from_code = from.trim().to_ascii_lowercase();
        let to_code = to.trim().to_ascii_lowercase();
        match (from_code.as_str(), to_code.as_str()) {
            ("pdf", "txt") => Ok(Self::PdfToText),
            ("pdf", "doc" | "docx") => Ok(Self::PdfToWord),
            ("txt", "doc" | "docx") => Ok(Self::TextToWord),
            ("docx", "txt") => Ok(Self::WordToText),
            ("csv", "xlsx") => Ok(Self::CsvToSheet),
            ("xlsx", "csv") => Ok(Self::SheetToCsv),
            ("xml", "txt") => Ok(Self::XmlToText),
            ("xml", "doc" | "docx") => Ok(Self::XmlToWord),
            _ => Err(DocumentError::Unsupported {
                from: from.trim().to_ascii_uppercase(),
                to: to.trim().to_ascii_uppercase(),
            }),
        }
    }

    pub fn run(self, data: &[u8]) -> Result<Vec<u8>, DocumentError> {
        match self {
            Self::PdfToText => Ok(pdf_text(data)?.into_bytes()),
            Self::PdfToWord => {
                let text = pdf_text(data)?;
                let lines: Vec<&str> = split_lines(&text)
                    .filter(|line| !line.trim().is_empty())
                    .collect();
                write_docx(&lines)
            }
            Self::TextToWord => {
                let text = String::from_utf8_lossy(data);
                let lines: Vec<&str> = split_lines(&text).collect();
                write_docx(&lines)
            }
            Self::WordToText => Ok(docx_text(data)?.into_bytes()),
            Self::CsvToSheet => {
                let text = String::from_utf8_lossy(data);
                write_xlsx(&parse_csv_rows(&text))
            }
            Self::SheetToCsv => Ok(render_csv(&read_first_sheet(data)?).into_bytes()),
            Self::XmlToText => Ok(xml_to_json(&String::from_utf8_lossy(data))?.into_bytes()),
            Self::XmlToWord => {
                let text = xml_to_json(&String::from_utf8_lossy(data))?;
                let lines: Vec<&str> = split_lines(&text).collect();
                write_docx(&lines)
            }
        }
    }
}

pub fn mime_type(code: &str) -> &'static str {
    match code.trim().to_ascii_lowercase().as_str() {
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

lazy_static! {
    // one alternation so runs, tabs, breaks and paragraph ends come out in document order
    static ref DOCX_TEXT: Regex =
        Regex::new(r"<w:t(?:\s[^>]*)?>([^<]*)</w:t>|<w:tab/>|<w:br/>|</w:p>").unwrap();
    static ref SHARED_STRING: Regex = Regex::new(r"(?s)<si>(.*?)</si>").unwrap();
    static ref TEXT_NODE: Regex = Regex::new(r"(?s)<t(?:\s[^>]*)?>(.*?)</t>").unwrap();
    static ref ROW: Regex = Regex::new(r"(?s)<row\b[^>]*?(?:/>|>(.*?)</row>)").unwrap();
    static ref CELL: Regex = Regex::new(r"(?s)<c\b([^>]*?)(?:/>|>(.*?)</c>)").unwrap();
    static ref CELL_REF: Regex = Regex::new(r#"\br="([A-Z]+)\d+""#).unwrap();
    static ref CELL_TYPE: Regex = Regex::new(r#"\bt="([a-zA-Z]+)""#).unwrap();
    static ref CELL_VALUE: Regex = Regex::new(r"(?s)<v>(.*?)</v>").unwrap();
    static ref FIRST_SHEET: Regex = Regex::new(r#"<sheet\b[^>]*?\br:id="([^"]+)""#).unwrap();
    static ref RELATIONSHIP: Regex = Regex::new(r"<Relationship\b[^>]*>").unwrap();
    static ref REL_ID: Regex = Regex::new(r#"\bId="([^"]+)""#).unwrap();
    static ref REL_TARGET: Regex = Regex::new(r#"\bTarget="([^"]+)""#).unwrap();
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line))
}

// ── PDF ──────────────────────────────────────────────────────────────────

fn pdf_text(data: &[u8]) -> Result<String, DocumentError> {
    let doc = lopdf::Document::load_mem(data)?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    if pages.is_empty() {
        return Ok(String::new());
    }
    Ok(doc.extract_text(&pages)?)
}

// ── Word ─────────────────────────────────────────────────────────────────

const DOCX_CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/></Types>"#;

const DOCX_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#;

/// One paragraph per line. Empty lines become a paragraph holding a space.
pub fn write_docx(lines: &[&str]) -> Result<Vec<u8>, DocumentError> {
    let mut body = String::new();
    for line in lines {
        let text = if line.is_empty() { " " } else { line };
        body.push_str(r#"<w:p><w:r><w:t xml:space="preserve">"#);
        body.push_str(&escape_xml(text));
        body.push_str("</w:t></w:r></w:p>");
    }
    let document = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}<w:sectPr/></w:body></w:document>"#
    );

    write_package(&[
        ("[Content_Types].xml", DOCX_CONTENT_TYPES),
        ("_rels/.rels", DOCX_RELS),
        ("word/document.xml", &document),
    ])
}

/// Raw text of a .docx, paragraphs separated by a blank line.
pub fn docx_text(data: &[u8]) -> Result<String, DocumentError> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let xml = read_part(&mut archive, "word/document.xml")?;

    let mut out = String::new();
    for caps in DOCX_TEXT.captures_iter(&xml) {
        match caps.get(1) {
            Some(text) => out.push_str(&unescape_xml(text.as_str())),
            None => match &caps[0] {
                "<w:tab/>" => out.push('\t'),
                "<w:br/>" => out.push('\n'),
                _ => out.push_str("\n\n"),
            },
        }
    }
    Ok(out)
}

// ── Spreadsheets ─────────────────────────────────────────────────────────

const XLSX_CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const XLSX_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const XLSX_WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets></workbook>"#;

const XLSX_WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

/// Naive CSV split: one row per line, one cell per comma. A trailing newline
/// does not produce an empty last row.
pub fn parse_csv_rows(text: &str) -> Vec<Vec<String>> {
    let mut lines: Vec<&str> = split_lines(text).collect();
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
        .into_iter()
        .map(|line| line.split(',').map(str::to_string).collect())
        .collect()
}

/// Single-sheet workbook named `Sheet1` with every cell stored as inline text.
pub fn write_xlsx(rows: &[Vec<String>]) -> Result<Vec<u8>, DocumentError> {
    let mut sheet_data = String::new();
    for (r, row) in rows.iter().enumerate() {
        let row_num = r + 1;
        sheet_data.push_str(&format!(r#"<row r="{row_num}">"#));
        for (c, cell) in row.iter().enumerate() {
            sheet_data.push_str(&format!(
                r#"<c r="{}{}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                column_name(c),
                row_num,
                escape_xml(cell)
            ));
        }
        sheet_data.push_str("</row>");
    }
    let sheet = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>{sheet_data}</sheetData></worksheet>"#
    );

    write_package(&[
        ("[Content_Types].xml", XLSX_CONTENT_TYPES),
        ("_rels/.rels", XLSX_RELS),
        ("xl/workbook.xml", XLSX_WORKBOOK),
        ("xl/_rels/workbook.xml.rels", XLSX_WORKBOOK_RELS),
        ("xl/worksheets/sheet1.xml", &sheet),
    ])
}

/// Cell text of the first sheet in workbook order, padded to a rectangle.
pub fn read_first_sheet(data: &[u8]) -> Result<Vec<Vec<String>>, DocumentError> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;

    let shared = match archive.by_name("xl/sharedStrings.xml") {
        Ok(part) => parse_shared_strings(&read_bounded(part, "xl/sharedStrings.xml")?),
        Err(zip::result::ZipError::FileNotFound) => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let sheet_path = first_sheet_path(&mut archive)?;
    let xml = read_part(&mut archive, &sheet_path)?;

    let mut rows = Vec::new();
    for row_caps in ROW.captures_iter(&xml) {
        let mut row: Vec<String> = Vec::new();
        let Some(cells) = row_caps.get(1) else {
            rows.push(row);
            continue;
        };
        for cell in CELL.captures_iter(cells.as_str()) {
            let attrs = &cell[1];
            let inner = cell.get(2).map(|m| m.as_str()).unwrap_or_default();

            let col = match CELL_REF.captures(attrs) {
                Some(c) => column_index(&c[1]).ok_or_else(|| {
                    DocumentError::Sheet(format!("cell reference {} is out of range", &c[1]))
                })?,
                None => row.len(),
            };
            if col >= MAX_COLUMNS {
                return Err(DocumentError::Sheet(format!(
                    "column {} is past the last column ({MAX_COLUMNS})",
                    col + 1
                )));
            }
            let value = cell_value(attrs, inner, &shared)?;

            if row.len() <= col {
                row.resize(col + 1, String::new());
            }
            row[col] = value;
        }
        rows.push(row);
    }

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width.saturating_mul(rows.len()) > MAX_CELLS {
        return Err(DocumentError::Sheet(format!(
            "{} rows by {width} columns is more than {MAX_CELLS} cells",
            rows.len()
        )));
    }
    for row in &mut rows {
        row.resize(width, String::new());
    }
    Ok(rows)
}

pub fn render_csv(rows: &[Vec<String>]) -> String {
    rows.iter()
        .map(|row| row.iter().map(|c| quote_csv(c)).collect::<Vec<_>>().join(","))
        .collect::<Vec<_>>()
        .join("\n")
}

fn quote_csv(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

fn parse_shared_strings(xml: &str) -> Vec<String> {
    SHARED_STRING
        .captures_iter(xml)
        .map(|si| {
            TEXT_NODE
                .captures_iter(&si[1])
                .map(|t| unescape_xml(&t[1]))
                .collect::<String>()
        })
        .collect()
}

fn cell_value(attrs: &str, inner: &str, shared: &[String]) -> Result<String, DocumentError> {
    let kind = CELL_TYPE.captures(attrs).map(|c| c[1].to_string());
    let raw = CELL_VALUE.captures(inner).map(|c| unescape_xml(&c[1]));

    match kind.as_deref() {
        Some("s") => {
            let idx: usize = raw
                .as_deref()
                .unwrap_or_default()
                .trim()
                .parse()
                .map_err(|_| DocumentError::Sheet("shared string index is not a number".into()))?;
            shared
                .get(idx)
                .cloned()
                .ok_or_else(|| DocumentError::Sheet(format!("shared string {idx} is missing")))
        }
        Some("inlineStr") => Ok(TEXT_NODE
            .captures_iter(inner)
            .map(|t| unescape_xml(&t[1]))
            .collect()),
        Some("b") => Ok(match raw.as_deref() {
            Some("1") => "TRUE".to_string(),
            Some(_) => "FALSE".to_string(),
            None => String::new(),
        }),
        _ => Ok(raw.unwrap_or_default()),
    }
}

// Resolve the first <sheet> of the workbook to its part name
fn first_sheet_path<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<String, DocumentError> {
    const FALLBACK: &str = "xl/worksheets/sheet1.xml";

    let workbook = match read_part(archive, "xl/workbook.xml") {
        Ok(xml) => xml,
        Err(_) => return Ok(FALLBACK.to_string()),
    };
    let Some(rel_id) = FIRST_SHEET.captures(&workbook).map(|c| c[1].to_string()) else {
        return Ok(FALLBACK.to_string());
    };
    let rels = match read_part(archive, "xl/_rels/workbook.xml.rels") {
        Ok(xml) => xml,
        Err(_) => return Ok(FALLBACK.to_string()),
    };

    let target = RELATIONSHIP
        .find_iter(&rels)
        .map(|m| m.as_str())
        .find(|tag| REL_ID.captures(tag).is_some_and(|c| c[1] == rel_id))
        .and_then(|tag| REL_TARGET.captures(tag).map(|c| c[1].to_string()));

    Ok(match target {
        Some(t) if t.starts_with('/') => t.trim_start_matches('/').to_string(),
        Some(t) => format!("xl/{t}"),
        None => FALLBACK.to_string(),
    })
}

// 0 -> A, 25 -> Z, 26 -> AA
fn column_name(mut index: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    name.reverse();
    String::from_utf8(name).unwrap_or_default()
}

// A -> 0, AA -> 26; None once the letters no longer fit a usize
fn column_index(name: &str) -> Option<usize> {
    name.bytes()
        .try_fold(0usize, |acc, b| {
            acc.checked_mul(26)?.checked_add((b - b'A' + 1) as usize)
        })?
        .checked_sub(1)
}

// ── XML ──────────────────────────────────────────────────────────────────

/// Deepest element nesting `xml_to_json` will follow.
pub const MAX_XML_DEPTH: usize = 256;

/// Pretty-printed JSON view of an XML document, two-space indented.
///
/// The root element becomes the single top-level key. Attributes, comments
/// and processing instructions are dropped. Repeated child names collect
/// into an array; an element holding both text and children keeps its text
/// under `#text`. Leaf text is trimmed, and numbers and booleans are typed.
pub fn xml_to_json(xml: &str) -> Result<String, DocumentError> {
    let doc = roxmltree::Document::parse(xml)?;
    let root = doc.root_element();

    let mut top = serde_json::Map::new();
    top.insert(root.tag_name().name().to_string(), element_value(root, 1)?);
    Ok(serde_json::to_string_pretty(&Value::Object(top))?)
}

fn element_value(node: roxmltree::Node<'_, '_>, depth: usize) -> Result<Value, DocumentError> {
    if depth > MAX_XML_DEPTH {
        return Err(DocumentError::TooDeep(MAX_XML_DEPTH));
    }

    let mut fields = serde_json::Map::new();
    let mut text = String::new();

    for child in node.children() {
        if child.is_element() {
            let value = element_value(child, depth + 1)?;
            let name = child.tag_name().name().to_string();
            match fields.get_mut(&name) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    fields.insert(name, value);
                }
            }
        } else if child.is_text() {
            text.push_str(child.text().unwrap_or_default());
        }
    }

    let text = text.trim();
    if fields.is_empty() {
        return Ok(scalar(text));
    }
    if !text.is_empty() {
        fields.insert("#text".to_string(), scalar(text));
    }
    Ok(Value::Object(fields))
}

fn scalar(text: &str) -> Value {
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = text.parse::<i64>() {
        return Value::from(n);
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite() && text.bytes().any(|b| b.is_ascii_digit()))
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(text.to_string()))
}

// ── Shared helpers ───────────────────────────────────────────────────────

fn write_package(parts: &[(&str, &str)]) -> Result<Vec<u8>, DocumentError> {
    let mut buf = Vec::new();
    let mut zip = ZipWriter::new(Cursor::new(&mut buf));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, contents) in parts {
        zip.start_file(*name, options)?;
        zip.write_all(contents.as_bytes())?;
    }
    zip.finish()?;
    Ok(buf)
}

fn read_part<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<String, DocumentError> {
    let part = archive.by_name(name)?;
    read_bounded(part, name)
}

// Decompressed parts are capped so a small upload cannot inflate without bound
fn read_bounded(part: impl Read, name: &str) -> Result<String, DocumentError> {
    let mut xml = String::new();
    part.take(MAX_PART_BYTES + 1).read_to_string(&mut xml)?;
    if xml.len() as u64 > MAX_PART_BYTES {
        return Err(DocumentError::Sheet(format!(
            "{name} is larger than {MAX_PART_BYTES} bytes once decompressed"
        )));
    }
    Ok(xml)
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

use std::collections::BTreeMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::Result;
use crate::models::{header_names, Scalar};

use super::local_name;

/// Row/column addressed cell access, 1-based like the sheet itself.
pub trait SheetGrid {
    fn cell(&self, row: u32, col: u32) -> Scalar;

    /// Highest row index holding any cell; 0 for an empty sheet.
    fn last_row(&self) -> u32;

    fn set_cell(&mut self, row: u32, col: u32, value: Scalar);

    /// Row 1 up to its last non-blank cell, with blank and repeated names
    /// disambiguated.
    fn header(&self) -> Vec<String> {
        let mut cells: Vec<Scalar> = (1..=self.last_col_in_row(1)).map(|c| self.cell(1, c)).collect();
        while cells.last().is_some_and(Scalar::is_blank) {
            cells.pop();
        }
        header_names(&cells)
    }

    fn last_col_in_row(&self, row: u32) -> u32;
}

/// Snapshot of one worksheet plus the edits made against it.
#[derive(Debug, Clone)]
pub struct Worksheet {
    name: String,
    part: String,
    cells: BTreeMap<(u32, u32), Scalar>,
    last_row: u32,
    edits: BTreeMap<(u32, u32), Scalar>,
}

impl Worksheet {
    pub(super) fn parse(name: &str, part: &str, xml: &[u8], shared: &[String]) -> Result<Self> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(false);
        let mut buf = Vec::new();

        let mut cells = BTreeMap::new();
        let mut last_row = 0u32;
        let mut cursor = CellCursor::default();
        let mut open: Option<OpenCell> = None;
        let mut capture = false;

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) | Event::Empty(e) if local_name(e.name().as_ref()) == b"row" => {
                    cursor.enter_row(row_number(&e)?);
                    last_row = last_row.max(cursor.row);
                }
                Event::Start(e) if local_name(e.name().as_ref()) == b"c" => {
                    let (row, col, kind) = cursor.enter_cell(&e)?;
                    last_row = last_row.max(row);
                    open = Some(OpenCell {
                        row,
                        col,
                        kind,
                        raw: String::new(),
                    });
                }
                Event::Empty(e) if local_name(e.name().as_ref()) == b"c" => {
                    let (row, _, _) = cursor.enter_cell(&e)?;
                    last_row = last_row.max(row);
                }
                Event::Start(e) if open.is_some() => {
                    capture = matches!(local_name(e.name().as_ref()), b"v" | b"t");
                }
                Event::Text(t) if capture => {
                    if let Some(cell) = open.as_mut() {
                        cell.raw.push_str(&t.unescape()?);
                    }
                }
                Event::End(e) => match local_name(e.name().as_ref()) {
                    b"v" | b"t" => capture = false,
                    b"c" => {
                        if let Some(cell) = open.take() {
                            let value = cell.value(shared);
                            if value != Scalar::Empty {
                                cells.insert((cell.row, cell.col), value);
                            }
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(Self {
            name: name.to_string(),
            part: part.to_string(),
            cells,
            last_row,
            edits: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn part_name(&self) -> &str {
        &self.part
    }

    pub fn has_edits(&self) -> bool {
        !self.edits.is_empty()
    }

    /// Pending cell values keyed by (row, col), row-major.
    pub fn edits(&self) -> &BTreeMap<(u32, u32), Scalar> {
        &self.edits
    }
}

impl SheetGrid for Worksheet {
    fn cell(&self, row: u32, col: u32) -> Scalar {
        self.cells.get(&(row, col)).cloned().unwrap_or_default()
    }

    fn last_row(&self) -> u32 {
        self.last_row
    }

    /// Writing the value a cell already holds records no edit.
    fn set_cell(&mut self, row: u32, col: u32, value: Scalar) {
        if self.cell(row, col) == value {
            return;
        }
        self.last_row = self.last_row.max(row);
        if value == Scalar::Empty {
            self.cells.remove(&(row, col));
        } else {
            self.cells.insert((row, col), value.clone());
        }
        self.edits.insert((row, col), value);
    }

    fn last_col_in_row(&self, row: u32) -> u32 {
        self.cells
            .range((row, 0)..=(row, u32::MAX))
            .map(|((_, col), _)| *col)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum CellKind {
    Number,
    Shared,
    Inline,
    Str,
    Bool,
    Error,
}

impl CellKind {
    fn from_attr(t: Option<&str>) -> Self {
        match t {
            Some("s") => Self::Shared,
            Some("inlineStr") => Self::Inline,
            Some("str") => Self::Str,
            Some("b") => Self::Bool,
            Some("e") => Self::Error,
            _ => Self::Number,
        }
    }
}

struct OpenCell {
    row: u32,
    col: u32,
    kind: CellKind,
    raw: String,
}

impl OpenCell {
    fn value(&self, shared: &[String]) -> Scalar {
        if self.raw.is_empty() && self.kind != CellKind::Inline {
            return Scalar::Empty;
        }
        match self.kind {
            CellKind::Shared => self
                .raw
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|idx| shared.get(idx))
                .map(|s| Scalar::text(s.as_str()))
                .unwrap_or_default(),
            CellKind::Inline | CellKind::Str | CellKind::Error => {
                if self.raw.is_empty() {
                    Scalar::Empty
                } else {
                    Scalar::text(self.raw.as_str())
                }
            }
            CellKind::Bool => Scalar::text(if self.raw.trim() == "1" { "TRUE" } else { "FALSE" }),
            CellKind::Number => match self.raw.trim().parse::<f64>() {
                Ok(n) => Scalar::Number(n),
                Err(_) => Scalar::text(self.raw.as_str()),
            },
        }
    }
}

/// Tracks the current row and column so cells without an `r` attribute get
/// the position the format implies (next row, next column).
#[derive(Debug, Default)]
pub(super) struct CellCursor {
    pub row: u32,
    col: u32,
}

impl CellCursor {
    pub fn enter_row(&mut self, explicit: Option<u32>) {
        self.row = explicit.unwrap_or(self.row + 1);
        self.col = 0;
    }

    pub fn enter_cell(&mut self, e: &BytesStart<'_>) -> Result<(u32, u32, CellKind)> {
        let attrs = cell_attrs(e)?;
        let (row, col) = match attrs.reference.as_deref().and_then(parse_a1) {
            Some(pos) => pos,
            None => (self.row, self.col + 1),
        };
        self.col = col;
        Ok((row, col, CellKind::from_attr(attrs.t.as_deref())))
    }
}

#[derive(Debug, Default)]
pub(super) struct CellAttrs {
    pub reference: Option<String>,
    pub t: Option<String>,
    pub s: Option<String>,
}

pub(super) fn cell_attrs(e: &BytesStart<'_>) -> Result<CellAttrs> {
    let mut attrs = CellAttrs::default();
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?.into_owned();
        match local_name(attr.key.as_ref()) {
            b"r" => attrs.reference = Some(value),
            b"t" => attrs.t = Some(value),
            b"s" => attrs.s = Some(value),
            _ => {}
        }
    }
    Ok(attrs)
}

pub(super) fn row_number(e: &BytesStart<'_>) -> Result<Option<u32>> {
    for attr in e.attributes() {
        let attr = attr?;
        if local_name(attr.key.as_ref()) == b"r" {
            return Ok(attr.unescape_value()?.trim().parse::<u32>().ok());
        }
    }
    Ok(None)
}

/// `"B12"` -> `(12, 2)`. Absolute markers (`$B$12`) are accepted.
pub(crate) fn parse_a1(reference: &str) -> Option<(u32, u32)> {
    let reference = reference.trim().replace('$', "");
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let mut col = 0u32;
    for c in letters.chars() {
        col = col.checked_mul(26)? + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    let row = digits.parse::<u32>().ok().filter(|r| *r > 0)?;
    Some((row, col))
}

/// `(12, 2)` -> `"B12"`.
pub(crate) fn to_a1(row: u32, col: u32) -> String {
    let mut letters = Vec::new();
    let mut n = col;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.reverse();
    format!("{}{row}", letters.into_iter().collect::<String>())
}

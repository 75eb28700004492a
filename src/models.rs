use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Presence filter: records without a student code are not counted.
pub const STUDENT_CODE: &str = "Student Code";
/// Presence filter: records without a course code are not counted.
pub const COURSE_CODE: &str = "Course Code";
/// Grouping field for the counts.
pub const SITE_NAME: &str = "Site Name";
/// Data sheet of the master workbook.
pub const MASTER_SHEET: &str = "Master Sheet";

/// A single cell value as seen by the core.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    #[default]
    Empty,
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Empty cells and text that trims to nothing.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Number(_) => false,
            Self::Text(s) => s.trim().is_empty(),
        }
    }

    /// Numeric reading of the cell: numbers as-is, numeric text parsed.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) if n.is_finite() => Some(*n),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    /// Blank or non-numeric values count as zero.
    pub fn coerce_number(&self) -> f64 {
        self.as_number().unwrap_or(0.0)
    }

    /// Text used to match entity keys. Text is taken verbatim, numbers in
    /// canonical form. Empty cells have no key.
    pub fn key_text(&self) -> Option<String> {
        match self {
            Self::Empty => None,
            Self::Number(n) => Some(format_number(*n)),
            Self::Text(s) => Some(s.clone()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Number(n) => f.write_str(&format_number(*n)),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

/// Integral values print without a fraction (`12`, not `12.0`).
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Column names for a header row. Blank cells become `Unnamed: <i>` and
/// repeated names get a `.1`, `.2`, ... suffix so every name is unique.
pub fn header_names(cells: &[Scalar]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(cells.len());
    for (i, cell) in cells.iter().enumerate() {
        let base = if cell.is_blank() {
            format!("Unnamed: {i}")
        } else {
            cell.to_string().trim().to_string()
        };
        let mut name = base.clone();
        let mut n = 1;
        while names.contains(&name) {
            name = format!("{base}.{n}");
            n += 1;
        }
        names.push(name);
    }
    names
}

/// Raw extract: a header plus rows aligned to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
}

impl SourceTable {
    pub fn new(header: Vec<String>) -> Self {
        Self {
            header,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, mut row: Vec<Scalar>) {
        row.resize(self.header.len(), Scalar::Empty);
        self.rows.push(row);
    }

    /// Index of `name`, comparing against trimmed header names. Case-sensitive.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h.trim() == name)
    }
}

/// The master table. The first header column is the entity key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
}

impl TargetTable {
    pub fn new(header: Vec<String>) -> Self {
        Self {
            header,
            rows: Vec::new(),
        }
    }

    /// Append a row, padding missing trailing cells with blanks.
    pub fn push_row(&mut self, mut row: Vec<Scalar>) {
        row.resize(self.header.len(), Scalar::Empty);
        self.rows.push(row);
    }

    pub fn key_column(&self) -> Option<&str> {
        self.header.first().map(String::as_str)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    /// Category columns: everything after the key column.
    pub fn category_columns(&self) -> &[String] {
        self.header.get(1..).unwrap_or_default()
    }

    pub fn key_of(&self, row: usize) -> Option<String> {
        self.rows.get(row)?.first()?.key_text()
    }

    /// First row whose key equals `key` exactly.
    pub fn find_row(&self, key: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.first().and_then(Scalar::key_text).as_deref() == Some(key))
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Scalar> {
        let col = self.column_index(column)?;
        self.rows.get(row)?.get(col)
    }
}

/// Qualifying record counts per group value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountMap {
    counts: BTreeMap<String, u64>,
}

impl CountMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, group: &str) {
        *self.counts.entry(group.to_string()).or_default() += 1;
    }

    pub fn insert(&mut self, group: impl Into<String>, count: u64) {
        if count > 0 {
            self.counts.insert(group.into(), count);
        }
    }

    pub fn get(&self, group: &str) -> Option<u64> {
        self.counts.get(group).copied()
    }

    /// Ascending group order; stable across calls.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for CountMap {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        let mut map = CountMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Add counts to the existing values.
    Add,
    /// Overwrite existing values with the counts.
    Replace,
}

impl UpdateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Replace => "replace",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "add" => Some(Self::Add),
            "replace" => Some(Self::Replace),
            _ => None,
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// An existing row was matched and its target cell rewritten.
    Updated { row: usize, previous: Scalar },
    /// A new row was appended for a previously unseen key.
    Inserted { row: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileEntry {
    pub key: String,
    pub count: u64,
    pub value: Scalar,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileLog {
    pub entries: Vec<ReconcileEntry>,
}

impl ReconcileLog {
    pub fn inserted(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, Outcome::Inserted { .. }))
            .count()
    }

    pub fn updated(&self) -> usize {
        self.entries.len() - self.inserted()
    }
}

//! Workbook carrier for the master document.
//!
//! The package is kept as its raw zip parts. Reading a worksheet yields a
//! [`Worksheet`] snapshot; edits to it are buffered and only reach the
//! package through [`Document::commit`], which rewrites that one worksheet
//! part. Every other part (styles, VBA project, other sheets) is written back
//! with the bytes it was loaded with.

mod patch;
mod recalc;
mod sheet;

use std::io::{Cursor, Read, Write};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;

use crate::error::{RecapError, Result};

pub use sheet::{SheetGrid, Worksheet};

const VBA_PROJECT_PART: &str = "xl/vbaProject.bin";
const CALC_CHAIN_PART: &str = "xl/calcChain.xml";
const CONTENT_TYPES_PART: &str = "[Content_Types].xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Workbook,
    MacroEnabled,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("xlsx") {
            Some(Self::Workbook)
        } else if ext.eq_ignore_ascii_case("xlsm") {
            Some(Self::MacroEnabled)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Workbook => "xlsx",
            Self::MacroEnabled => "xlsm",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Workbook => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            Self::MacroEnabled => "application/vnd.ms-excel.sheet.macroEnabled.12",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    // Zip entry order is kept so the rewritten archive lists parts as loaded.
    parts: Vec<(String, Vec<u8>)>,
    kind: DocumentKind,
}

#[derive(Debug, Clone)]
struct Relationship {
    id: String,
    type_uri: String,
    target: String,
    external: bool,
}

impl Document {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut parts = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            if !file.is_file() {
                continue;
            }
            let mut buf = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut buf)?;
            parts.push((file.name().to_string(), buf));
        }
        let mut doc = Self {
            parts,
            kind: DocumentKind::Workbook,
        };
        if doc.part(VBA_PROJECT_PART).is_some() {
            doc.kind = DocumentKind::MacroEnabled;
        }
        doc.workbook_part()?;
        debug!(parts = doc.parts.len(), kind = ?doc.kind, "loaded workbook package");
        Ok(doc)
    }

    /// Load from disk. An `.xlsm` extension marks the document macro-enabled
    /// even when no VBA project is present.
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::load(&bytes, path)
    }

    /// Like [`Document::open`] for bytes already read from `path`.
    pub fn load(bytes: &[u8], path: &Path) -> Result<Self> {
        let mut doc = Self::from_bytes(bytes)
            .map_err(|e| RecapError::Parse(format!("{}: {e}", path.display())))?;
        if DocumentKind::from_path(path) == Some(DocumentKind::MacroEnabled) {
            doc.kind = DocumentKind::MacroEnabled;
        }
        Ok(doc)
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        let name = name.strip_prefix('/').unwrap_or(name);
        self.parts
            .iter()
            .find(|(n, _)| n.strip_prefix('/').unwrap_or(n) == name)
            .map(|(_, bytes)| bytes.as_slice())
    }

    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(|(n, _)| n.as_str())
    }

    fn set_part(&mut self, name: &str, bytes: Vec<u8>) {
        let key = name.strip_prefix('/').unwrap_or(name);
        match self
            .parts
            .iter_mut()
            .find(|(n, _)| n.strip_prefix('/').unwrap_or(n) == key)
        {
            Some(entry) => entry.1 = bytes,
            None => self.parts.push((key.to_string(), bytes)),
        }
    }

    fn remove_part(&mut self, name: &str) -> bool {
        let name = name.strip_prefix('/').unwrap_or(name);
        let before = self.parts.len();
        self.parts
            .retain(|(n, _)| n.strip_prefix('/').unwrap_or(n) != name);
        self.parts.len() != before
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, bytes) in &self.parts {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(bytes)?;
        }
        Ok(zip.finish()?.into_inner())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        info!(path = %path.display(), "saved workbook");
        Ok(())
    }

    /// Worksheet names in workbook order.
    pub fn sheet_names(&self) -> Result<Vec<String>> {
        Ok(self.sheets()?.into_iter().map(|(name, _)| name).collect())
    }

    /// Parse the named worksheet into an editable snapshot.
    pub fn worksheet(&self, name: &str) -> Result<Worksheet> {
        let part = self.worksheet_part(name)?;
        let xml = self
            .part(&part)
            .ok_or_else(|| RecapError::Parse(format!("missing worksheet part {part}")))?;
        let shared = self.shared_strings()?;
        Worksheet::parse(name, &part, xml, &shared)
    }

    /// Write the buffered edits of `sheet` into its worksheet part.
    ///
    /// Every replacement part is built in full before anything is swapped in,
    /// so a failure leaves the document as it was. Overwriting a formula also
    /// drops the calc chain and forces a full recalculation on open.
    pub fn commit(&mut self, sheet: &Worksheet) -> Result<()> {
        if !sheet.has_edits() {
            return Ok(());
        }
        let original = self
            .part(sheet.part_name())
            .ok_or_else(|| RecapError::Parse(format!("missing worksheet part {}", sheet.part_name())))?;
        let patched = patch::apply(original, sheet.edits())?;

        let mut updates = vec![(sheet.part_name().to_string(), patched.xml)];
        let mut calc_chain = None;
        if patched.formula_removed {
            let (part, fixups) = self.recalc_fixups()?;
            updates.extend(fixups);
            calc_chain = Some(part);
        }

        for (name, bytes) in updates {
            self.set_part(&name, bytes);
        }
        if let Some(part) = calc_chain {
            if self.remove_part(&part) {
                debug!(part = %part, "dropped calc chain after overwriting formula cells");
            }
        }
        info!(sheet = sheet.name(), cells = sheet.edits().len(), "committed worksheet edits");
        Ok(())
    }

    /// The calc chain part name plus rewritten workbook, workbook
    /// relationships and content types that no longer mention it.
    fn recalc_fixups(&self) -> Result<(String, Vec<(String, Vec<u8>)>)> {
        let workbook = self.workbook_part()?;
        let rels_name = rels_part_name(&workbook);
        let calc_chain = self
            .workbook_relationships(&workbook)?
            .into_iter()
            .find(|r| r.type_uri == recalc::CALC_CHAIN_REL && !r.external)
            .map(|r| resolve_target(&workbook, &r.target))
            .unwrap_or_else(|| CALC_CHAIN_PART.to_string());

        let mut fixups = Vec::new();
        if let Some(xml) = self.part(&workbook) {
            fixups.push((workbook.clone(), recalc::force_full_calc_on_load(xml)?));
        }
        if let Some(xml) = self.part(&rels_name) {
            fixups.push((rels_name.clone(), recalc::remove_calc_chain_relationship(xml)?));
        }
        if let Some(xml) = self.part(CONTENT_TYPES_PART) {
            fixups.push((
                CONTENT_TYPES_PART.to_string(),
                recalc::remove_content_type_override(xml, &calc_chain)?,
            ));
        }
        Ok((calc_chain, fixups))
    }

    fn workbook_part(&self) -> Result<String> {
        let from_rels = match self.part("_rels/.rels") {
            Some(rels) => parse_relationships(rels)?
                .into_iter()
                .find(|r| r.type_uri.ends_with("/officeDocument") && !r.external)
                .map(|r| resolve_target("", &r.target)),
            None => None,
        };
        let part = from_rels.unwrap_or_else(|| "xl/workbook.xml".to_string());
        if self.part(&part).is_none() {
            return Err(RecapError::Parse("not a workbook: missing workbook part".to_string()));
        }
        Ok(part)
    }

    fn workbook_relationships(&self, workbook: &str) -> Result<Vec<Relationship>> {
        match self.part(&rels_part_name(workbook)) {
            Some(bytes) => parse_relationships(bytes),
            None => Ok(Vec::new()),
        }
    }

    /// (name, worksheet part) pairs in workbook order.
    fn sheets(&self) -> Result<Vec<(String, String)>> {
        let workbook = self.workbook_part()?;
        let rels = self.workbook_relationships(&workbook)?;
        let xml = self.part(&workbook).unwrap_or_default();

        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut sheets = Vec::new();
        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) | Event::Empty(e) if local_name(e.name().as_ref()) == b"sheet" => {
                    let mut name = None;
                    let mut rel_id = None;
                    for attr in e.attributes() {
                        let attr = attr?;
                        match attr.key.as_ref() {
                            b"name" => name = Some(attr.unescape_value()?.into_owned()),
                            key if local_name(key) == b"id" && key != b"id" => {
                                rel_id = Some(attr.unescape_value()?.into_owned())
                            }
                            _ => {}
                        }
                    }
                    if let (Some(name), Some(rel_id)) = (name, rel_id) {
                        let target = rels
                            .iter()
                            .find(|r| r.id == rel_id && !r.external)
                            .map(|r| resolve_target(&workbook, &r.target));
                        if let Some(target) = target {
                            sheets.push((name, target));
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(sheets)
    }

    fn worksheet_part(&self, name: &str) -> Result<String> {
        self.sheets()?
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, part)| part)
            .ok_or_else(|| RecapError::Parse(format!("worksheet '{name}' not found")))
    }

    fn shared_strings(&self) -> Result<Vec<String>> {
        let workbook = self.workbook_part()?;
        let part = self
            .workbook_relationships(&workbook)?
            .into_iter()
            .find(|r| r.type_uri.ends_with("/sharedStrings") && !r.external)
            .map(|r| resolve_target(&workbook, &r.target))
            .unwrap_or_else(|| "xl/sharedStrings.xml".to_string());
        match self.part(&part) {
            Some(bytes) => parse_shared_strings(bytes),
            None => Ok(Vec::new()),
        }
    }
}

fn rels_part_name(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

/// Resolve a relationship target against the part that owns the relationship.
fn resolve_target(base_part: &str, target: &str) -> String {
    let target = target.split_once('#').map_or(target, |(t, _)| t);
    let (target, base_dir) = match target.strip_prefix('/') {
        Some(abs) => (abs, ""),
        None => (target, base_part.rsplit_once('/').map_or("", |(dir, _)| dir)),
    };
    let mut components: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            _ => components.push(segment),
        }
    }
    components.join("/")
}

fn parse_relationships(xml: &[u8]) -> Result<Vec<Relationship>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e)
                if local_name(e.name().as_ref()) == b"Relationship" =>
            {
                let (mut id, mut type_uri, mut target, mut external) = (None, None, None, false);
                for attr in e.attributes() {
                    let attr = attr?;
                    let value = attr.unescape_value()?.into_owned();
                    match local_name(attr.key.as_ref()) {
                        b"Id" => id = Some(value),
                        b"Type" => type_uri = Some(value),
                        b"Target" => target = Some(value),
                        b"TargetMode" => external = value.eq_ignore_ascii_case("External"),
                        _ => {}
                    }
                }
                if let (Some(id), Some(type_uri), Some(target)) = (id, type_uri, target) {
                    out.push(Relationship {
                        id,
                        type_uri,
                        target,
                        external,
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Plain text of every `<si>` item. Phonetic runs are skipped.
fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut items = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    let mut phonetic_depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match local_name(e.name().as_ref()) {
                b"si" => current = Some(String::new()),
                b"rPh" => phonetic_depth += 1,
                b"t" if phonetic_depth == 0 => in_text = true,
                _ => {}
            },
            Event::Empty(e) if local_name(e.name().as_ref()) == b"si" => {
                items.push(String::new());
            }
            Event::Text(t) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&t.unescape()?);
                }
            }
            Event::CData(t) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Event::End(e) => match local_name(e.name().as_ref()) {
                b"si" => items.extend(current.take()),
                b"rPh" => phonetic_depth = phonetic_depth.saturating_sub(1),
                b"t" => in_text = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(items)
}

pub(crate) fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|b| *b == b':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

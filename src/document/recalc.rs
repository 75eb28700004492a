//! Package fixups for when a formula cell has been overwritten: the calc
//! chain is dropped along with every reference to it, and Excel is told to
//! recalculate the whole workbook on open.

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::Result;

use super::local_name;

pub(super) const CALC_CHAIN_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/calcChain";

/// `workbook.xml` children that must follow `<calcPr>`.
const AFTER_CALC_PR: &[&[u8]] = &[
    b"oleSize",
    b"customWorkbookViews",
    b"pivotCaches",
    b"smartTagPr",
    b"smartTagTypes",
    b"webPublishing",
    b"fileRecoveryPr",
    b"webPublishObjects",
    b"extLst",
];

/// Set `fullCalcOnLoad="1"` on `<calcPr>`, adding the element if missing.
pub(super) fn force_full_calc_on_load(workbook_xml: &[u8]) -> Result<Vec<u8>> {
    let mut reader = Reader::from_reader(workbook_xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(workbook_xml.len() + 48));
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut done = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Empty(e) if depth == 1 && local_name(e.name().as_ref()) == b"calcPr" => {
                writer.write_event(Event::Empty(with_full_calc(&e)?))?;
                done = true;
            }
            Event::Start(e) if depth == 1 && local_name(e.name().as_ref()) == b"calcPr" => {
                writer.write_event(Event::Start(with_full_calc(&e)?))?;
                done = true;
                depth += 1;
            }
            Event::Start(e) => {
                if depth == 1 && !done && follows_calc_pr(e.name().as_ref()) {
                    write_calc_pr(&mut writer)?;
                    done = true;
                }
                depth += 1;
                writer.write_event(Event::Start(e.into_owned()))?;
            }
            Event::Empty(e) => {
                if depth == 1 && !done && follows_calc_pr(e.name().as_ref()) {
                    write_calc_pr(&mut writer)?;
                    done = true;
                }
                writer.write_event(Event::Empty(e.into_owned()))?;
            }
            Event::End(e) => {
                if depth == 1 && !done {
                    write_calc_pr(&mut writer)?;
                    done = true;
                }
                depth = depth.saturating_sub(1);
                writer.write_event(Event::End(e.into_owned()))?;
            }
            Event::Eof => break,
            ev => writer.write_event(ev.into_owned())?,
        }
        buf.clear();
    }
    Ok(writer.into_inner())
}

fn follows_calc_pr(name: &[u8]) -> bool {
    let name = local_name(name);
    AFTER_CALC_PR.iter().any(|n| *n == name)
}

fn write_calc_pr(writer: &mut Writer<Vec<u8>>) -> Result<()> {
    let mut calc_pr = BytesStart::new("calcPr");
    calc_pr.push_attribute(("fullCalcOnLoad", "1"));
    writer.write_event(Event::Empty(calc_pr))?;
    Ok(())
}

fn with_full_calc(e: &BytesStart<'_>) -> Result<BytesStart<'static>> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() != b"fullCalcOnLoad" {
            out.push_attribute(attr);
        }
    }
    out.push_attribute(("fullCalcOnLoad", "1"));
    Ok(out)
}

/// Drop the calc chain `<Relationship>` from a relationships part.
pub(super) fn remove_calc_chain_relationship(rels_xml: &[u8]) -> Result<Vec<u8>> {
    drop_elements(rels_xml, b"Relationship", |e| {
        let mut is_calc_chain = false;
        for attr in e.attributes() {
            let attr = attr?;
            match attr.key.as_ref() {
                b"Type" => is_calc_chain |= attr.unescape_value()? == CALC_CHAIN_REL,
                b"Target" => is_calc_chain |= attr.unescape_value()?.ends_with("calcChain.xml"),
                _ => {}
            }
        }
        Ok(is_calc_chain)
    })
}

/// Drop the `<Override>` for `part` from `[Content_Types].xml`.
pub(super) fn remove_content_type_override(ct_xml: &[u8], part: &str) -> Result<Vec<u8>> {
    let part = part.trim_start_matches('/');
    drop_elements(ct_xml, b"Override", |e| {
        for attr in e.attributes() {
            let attr = attr?;
            if attr.key.as_ref() == b"PartName" {
                return Ok(attr.unescape_value()?.trim_start_matches('/') == part);
            }
        }
        Ok(false)
    })
}

/// Stream `xml` through, leaving out every `name` element `reject` accepts.
fn drop_elements(
    xml: &[u8],
    name: &[u8],
    reject: impl Fn(&BytesStart<'_>) -> Result<bool>,
) -> Result<Vec<u8>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut buf = Vec::new();
    let mut skipping = 0usize;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::Start(_) if skipping > 0 => skipping += 1,
            Event::End(_) if skipping > 0 => skipping -= 1,
            _ if skipping > 0 => {}
            Event::Start(e) if local_name(e.name().as_ref()) == name => {
                if reject(&e)? {
                    skipping = 1;
                } else {
                    writer.write_event(Event::Start(e.into_owned()))?;
                }
            }
            Event::Empty(e) if local_name(e.name().as_ref()) == name => {
                if !reject(&e)? {
                    writer.write_event(Event::Empty(e.into_owned()))?;
                }
            }
            ev => writer.write_event(ev.into_owned())?,
        }
        buf.clear();
    }
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_full_calc_replaces_existing_flag() {
        let xml = r#"<workbook><sheets/><calcPr calcId="124519" fullCalcOnLoad="0"/></workbook>"#;
        let out = text(force_full_calc_on_load(xml.as_bytes()).unwrap());
        assert_eq!(
            out,
            r#"<workbook><sheets/><calcPr calcId="124519" fullCalcOnLoad="1"/></workbook>"#
        );
    }

    #[test]
    fn test_full_calc_added_before_later_siblings() {
        let xml = r#"<workbook><sheets><sheet name="A"/></sheets><extLst><ext/></extLst></workbook>"#;
        let out = text(force_full_calc_on_load(xml.as_bytes()).unwrap());
        assert_eq!(
            out,
            r#"<workbook><sheets><sheet name="A"/></sheets><calcPr fullCalcOnLoad="1"/><extLst><ext/></extLst></workbook>"#
        );
    }

    #[test]
    fn test_full_calc_added_at_end() {
        let xml = r#"<workbook><sheets/></workbook>"#;
        let out = text(force_full_calc_on_load(xml.as_bytes()).unwrap());
        assert_eq!(out, r#"<workbook><sheets/><calcPr fullCalcOnLoad="1"/></workbook>"#);
    }

    #[test]
    fn test_calc_chain_relationship_removed() {
        let xml = format!(
            r#"<Relationships><Relationship Id="rId1" Type="x/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId9" Type="{CALC_CHAIN_REL}" Target="calcChain.xml"/></Relationships>"#
        );
        let out = text(remove_calc_chain_relationship(xml.as_bytes()).unwrap());
        assert!(!out.contains("calcChain"));
        assert!(out.contains(r#"Id="rId1""#));
    }

    #[test]
    fn test_content_type_override_removed() {
        let xml = r#"<Types><Override PartName="/xl/workbook.xml" ContentType="a"/><Override PartName="/xl/calcChain.xml" ContentType="b"></Override></Types>"#;
        let out = text(remove_content_type_override(xml.as_bytes(), "xl/calcChain.xml").unwrap());
        assert_eq!(out, r#"<Types><Override PartName="/xl/workbook.xml" ContentType="a"/></Types>"#);
    }
}

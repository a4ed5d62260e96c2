//! Light-weight metadata extraction for downloaded documents.
//!
//! Each collection gets one parser behind the [`RecordParser`] capability,
//! selected through [`parser_for`]. Parsers pull identifying fields from
//! the filename and the XML body; relational persistence of the records
//! is owned elsewhere.

use std::path::Path;

use quick_xml::{events::Event, Reader};

use crate::types::DocumentType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentRecord {
    Bill(BillRecord),
    BillStatus(BillStatusRecord),
    PublicLaw(PublicLawRecord),
    Statute(StatuteRecord),
    FederalRegister(FederalRegisterRecord),
    CongressionalRecord(CrecRecord),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillRecord {
    pub congress: Option<u32>,
    pub session: Option<u32>,
    pub bill_type: Option<String>,
    pub bill_number: Option<u32>,
    pub official_title: Option<String>,
    pub sponsor: Option<String>,
    pub stage: Option<String>,
}

impl BillRecord {
    /// Stable identifier of the form `118-hr-1`.
    pub fn bill_id(&self) -> Option<String> {
        Some(format!(
            "{}-{}-{}",
            self.congress?,
            self.bill_type.as_deref()?.to_ascii_lowercase(),
            self.bill_number?
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillStatusRecord {
    pub congress: Option<u32>,
    pub bill_type: Option<String>,
    pub bill_number: Option<u32>,
    pub origin_chamber: Option<String>,
    pub latest_action_date: Option<String>,
    pub latest_action_text: Option<String>,
    pub policy_area: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicLawRecord {
    pub congress: Option<u32>,
    pub law_type: Option<String>,
    pub law_number: Option<u32>,
    pub title: Option<String>,
    pub enactment_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatuteRecord {
    pub volume: Option<u32>,
    pub page: Option<u32>,
    pub title: Option<String>,
    pub enactment_date: Option<String>,
}

impl StatuteRecord {
    pub fn citation(&self) -> Option<String> {
        Some(format!("{} Stat. {}", self.volume?, self.page?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FederalRegisterRecord {
    pub document_number: Option<String>,
    pub agency: Option<String>,
    pub title: Option<String>,
    pub action: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrecRecord {
    pub issue_date: Option<String>,
    pub title: Option<String>,
}

/// One parser per collection.
pub trait RecordParser: Send + Sync {
    fn collection(&self) -> DocumentType;
    fn parse(&self, path: &Path, content: &str) -> Option<DocumentRecord>;
}

/// Registry mapping a collection tag to its parser.
pub fn parser_for(doc_type: DocumentType) -> Box<dyn RecordParser> {
    match doc_type {
        DocumentType::Bills => Box::new(BillsParser),
        DocumentType::BillStatus => Box::new(BillStatusParser),
        DocumentType::PublicLaw => Box::new(PublicLawParser),
        DocumentType::Statute => Box::new(StatuteParser),
        DocumentType::FederalRegister => Box::new(FederalRegisterParser),
        DocumentType::CongressionalRecord => Box::new(CrecParser),
    }
}

struct BillsParser;

impl RecordParser for BillsParser {
    fn collection(&self) -> DocumentType {
        DocumentType::Bills
    }

    fn parse(&self, _path: &Path, content: &str) -> Option<DocumentRecord> {
        let mut record = BillRecord {
            congress: first_text(content, "congress").and_then(|t| digits_u32(&t)),
            session: first_text(content, "session").and_then(|t| digits_u32(&t)),
            official_title: first_text(content, "official-title"),
            sponsor: first_text(content, "sponsor"),
            stage: root_attribute(content, "bill-stage")
                .or_else(|| root_attribute(content, "resolution-stage")),
            ..Default::default()
        };

        if let Some(legis_num) = first_text(content, "legis-num") {
            let (bill_type, bill_number) = split_legis_num(&legis_num);
            record.bill_type = bill_type;
            record.bill_number = bill_number;
        }

        if record.congress.is_none() && record.official_title.is_none() {
            return None;
        }
        Some(DocumentRecord::Bill(record))
    }
}

struct BillStatusParser;

impl RecordParser for BillStatusParser {
    fn collection(&self) -> DocumentType {
        DocumentType::BillStatus
    }

    fn parse(&self, _path: &Path, content: &str) -> Option<DocumentRecord> {
        let record = BillStatusRecord {
            congress: first_text(content, "congress").and_then(|t| digits_u32(&t)),
            bill_type: first_text(content, "type"),
            bill_number: first_text(content, "number").and_then(|t| digits_u32(&t)),
            origin_chamber: first_text(content, "originChamber"),
            latest_action_date: first_text(content, "actionDate"),
            latest_action_text: first_text(content, "text"),
            policy_area: first_text(content, "name"),
        };

        record.congress?;
        Some(DocumentRecord::BillStatus(record))
    }
}

struct PublicLawParser;

impl RecordParser for PublicLawParser {
    fn collection(&self) -> DocumentType {
        DocumentType::PublicLaw
    }

    /// Identity comes from the filename (`PLAW-113publ1.xml`), the rest
    /// from the XML metadata.
    fn parse(&self, path: &Path, content: &str) -> Option<DocumentRecord> {
        let mut record = PublicLawRecord {
            title: first_text(content, "title"),
            enactment_date: first_text(content, "date").or_else(|| first_text(content, "approved")),
            ..Default::default()
        };

        if let Some(stem) = file_stem(path) {
            if let Some(rest) = stem.strip_prefix("PLAW-") {
                for (marker, law_type) in [("publ", "public"), ("pvt", "private")] {
                    if let Some((congress, number)) = rest.split_once(marker) {
                        record.congress = digits_u32(congress);
                        record.law_number = digits_u32(number);
                        record.law_type = Some(law_type.to_string());
                        break;
                    }
                }
            }
        }

        record.congress?;
        Some(DocumentRecord::PublicLaw(record))
    }
}

struct StatuteParser;

impl RecordParser for StatuteParser {
    fn collection(&self) -> DocumentType {
        DocumentType::Statute
    }

    /// Filename pattern `STATUTE-<volume>-Pg<page>.xml`.
    fn parse(&self, path: &Path, content: &str) -> Option<DocumentRecord> {
        let mut record = StatuteRecord {
            title: first_text(content, "title"),
            enactment_date: first_text(content, "date"),
            ..Default::default()
        };

        if let Some(stem) = file_stem(path) {
            let mut parts = stem.split('-');
            if parts.next() == Some("STATUTE") {
                record.volume = parts.next().and_then(digits_u32);
                record.page = parts.next().and_then(digits_u32);
            }
        }
        if record.volume.is_none() {
            record.volume = first_text(content, "volume").and_then(|t| digits_u32(&t));
        }

        record.volume?;
        Some(DocumentRecord::Statute(record))
    }
}

struct FederalRegisterParser;

impl RecordParser for FederalRegisterParser {
    fn collection(&self) -> DocumentType {
        DocumentType::FederalRegister
    }

    fn parse(&self, _path: &Path, content: &str) -> Option<DocumentRecord> {
        let record = FederalRegisterRecord {
            document_number: first_text(content, "DOCNO").or_else(|| first_text(content, "FRDOC")),
            agency: first_text(content, "AGENCY"),
            title: first_text(content, "SUBJECT").or_else(|| first_text(content, "TITLE")),
            action: first_text(content, "ACTION"),
        };

        if record.document_number.is_none() && record.title.is_none() {
            return None;
        }
        Some(DocumentRecord::FederalRegister(record))
    }
}

struct CrecParser;

impl RecordParser for CrecParser {
    fn collection(&self) -> DocumentType {
        DocumentType::CongressionalRecord
    }

    /// Filename pattern `CREC-<yyyy>-<mm>-<dd>[-…].xml`.
    fn parse(&self, path: &Path, content: &str) -> Option<DocumentRecord> {
        let issue_date = file_stem(path)
            .and_then(|stem| stem.strip_prefix("CREC-").map(String::from))
            .map(|rest| rest.split('-').take(3).collect::<Vec<_>>().join("-"))
            .filter(|date| date.len() == 10);

        let record = CrecRecord {
            issue_date,
            title: first_text(content, "title"),
        };

        record.issue_date.as_ref()?;
        Some(DocumentRecord::CongressionalRecord(record))
    }
}

/// Text of the first element with the given local name.
fn first_text(content: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut capture = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => capture = local_name(e.name().as_ref()) == tag,
            Ok(Event::Text(t)) if capture => {
                return t
                    .unescape()
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
            }
            Ok(Event::End(_)) => capture = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Attribute of the document's root element.
fn root_attribute(content: &str, attr: &str) -> Option<String> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return e
                    .attributes()
                    .filter_map(|a| a.ok())
                    .find(|a| a.key.as_ref() == attr.as_bytes())
                    .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Split a legislative number like `H. R. 1` into type and number.
fn split_legis_num(text: &str) -> (Option<String>, Option<u32>) {
    let digit_start = match text.find(|c: char| c.is_ascii_digit()) {
        Some(i) => i,
        None => return (None, None),
    };
    let prefix: String = text[..digit_start]
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    let number = digits_u32(&text[digit_start..]);

    let bill_type = if prefix.is_empty() { None } else { Some(prefix) };
    (bill_type, number)
}

fn digits_u32(text: &str) -> Option<u32> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn file_stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

fn local_name(name: &[u8]) -> &str {
    let raw = std::str::from_utf8(name).unwrap_or("");
    raw.rsplit(':').next().unwrap_or(raw)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn registry_matches_collections() {
        for doc_type in DocumentType::all() {
            assert_eq!(parser_for(doc_type).collection(), doc_type);
        }
    }

    #[test]
    fn parses_bill_form() {
        let xml = r#"<bill bill-stage="Introduced-in-House">
            <form>
                <congress>118th CONGRESS</congress>
                <session>1st Session</session>
                <legis-num>H. R. 21</legis-num>
                <official-title>An Act to test parsing.</official-title>
            </form>
        </bill>"#;

        let parsed = parser_for(DocumentType::Bills)
            .parse(&PathBuf::from("BILLS-118hr21ih.xml"), xml)
            .unwrap();
        let record = match parsed {
            DocumentRecord::Bill(r) => r,
            other => panic!("unexpected record {other:?}"),
        };

        assert_eq!(record.congress, Some(118));
        assert_eq!(record.session, Some(1));
        assert_eq!(record.bill_type.as_deref(), Some("HR"));
        assert_eq!(record.bill_number, Some(21));
        assert_eq!(record.bill_id().as_deref(), Some("118-hr-21"));
        assert_eq!(record.stage.as_deref(), Some("Introduced-in-House"));
    }

    #[test]
    fn parses_public_law_from_filename() {
        let xml = "<law><title>An Act</title></law>";
        let parsed = parser_for(DocumentType::PublicLaw)
            .parse(&PathBuf::from("PLAW-113publ1.xml"), xml)
            .unwrap();
        let record = match parsed {
            DocumentRecord::PublicLaw(r) => r,
            other => panic!("unexpected record {other:?}"),
        };

        assert_eq!(record.congress, Some(113));
        assert_eq!(record.law_type.as_deref(), Some("public"));
        assert_eq!(record.law_number, Some(1));
        assert_eq!(record.title.as_deref(), Some("An Act"));
    }

    #[test]
    fn parses_statute_citation() {
        let parsed = parser_for(DocumentType::Statute)
            .parse(&PathBuf::from("STATUTE-127-Pg54.xml"), "<statute/>")
            .unwrap();
        let record = match parsed {
            DocumentRecord::Statute(r) => r,
            other => panic!("unexpected record {other:?}"),
        };

        assert_eq!(record.volume, Some(127));
        assert_eq!(record.page, Some(54));
        assert_eq!(record.citation().as_deref(), Some("127 Stat. 54"));
    }

    #[test]
    fn parses_crec_issue_date() {
        let parsed = parser_for(DocumentType::CongressionalRecord)
            .parse(&PathBuf::from("CREC-2023-01-03.xml"), "<record/>")
            .unwrap();
        match parsed {
            DocumentRecord::CongressionalRecord(r) => {
                assert_eq!(r.issue_date.as_deref(), Some("2023-01-03"))
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn unidentifiable_documents_yield_no_record() {
        assert!(parser_for(DocumentType::PublicLaw)
            .parse(&PathBuf::from("not-a-law.xml"), "<law/>")
            .is_none());
        assert!(parser_for(DocumentType::Bills)
            .parse(&PathBuf::from("BILLS-x.xml"), "<other/>")
            .is_none());
    }
}

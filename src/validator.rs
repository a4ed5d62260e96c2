use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use quick_xml::{events::Event, Reader};

use crate::types::IngestError;

/// Validates downloaded documents against locally held XSD schemas.
///
/// Schemas are loaded once at construction, keyed by file stem. A
/// document passes when it is well-formed XML and its root element is one
/// of the schema's top-level declarations. Documents whose collection has
/// no schema on disk are not validated at all, mirroring the repository's
/// incomplete schema coverage.
pub struct XmlValidator {
    schema_dir: PathBuf,
    schemas: HashMap<String, SchemaInfo>,
}

#[derive(Debug, Clone)]
struct SchemaInfo {
    roots: HashSet<String>,
}

impl XmlValidator {
    pub fn new(schema_dir: &Path) -> anyhow::Result<XmlValidator> {
        if !schema_dir.exists() {
            fs::create_dir_all(schema_dir)
                .context(format!("could not create schema dir {:?}", schema_dir))?;
        }

        let mut validator = XmlValidator {
            schema_dir: schema_dir.to_path_buf(),
            schemas: HashMap::new(),
        };
        validator.load_schemas()?;
        Ok(validator)
    }

    pub fn schema_dir(&self) -> &Path {
        &self.schema_dir
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    fn load_schemas(&mut self) -> anyhow::Result<()> {
        self.schemas.clear();
        let entries = fs::read_dir(&self.schema_dir)
            .context(format!("could not read schema dir {:?}", self.schema_dir))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().map(|e| e == "xsd") != Some(true) {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s.to_string(),
                None => continue,
            };
            let content = fs::read_to_string(&path)
                .context(format!("could not read schema {:?}", path))?;
            match parse_schema_roots(&content) {
                Ok(roots) if !roots.is_empty() => {
                    debug!("loaded schema {} with roots {:?}", stem, roots);
                    self.schemas.insert(stem, SchemaInfo { roots });
                }
                Ok(_) => warn!("schema {:?} declares no top-level elements, ignoring", path),
                Err(e) => error!("failed to load schema {:?}: {}", path, e),
            }
        }

        info!(
            "{} schema(s) loaded from {:?}",
            self.schemas.len(),
            self.schema_dir
        );
        Ok(())
    }

    /// Validate document content against the named schema. Returns the
    /// collected errors on failure so the caller can log a capped preview.
    pub fn validate(&self, content: &str, schema_name: &str) -> Result<(), Vec<String>> {
        let schema = match self.schemas.get(schema_name) {
            Some(s) => s,
            None => return Err(vec![format!("schema {} not found", schema_name)]),
        };

        let root = match well_formed_root(content) {
            Ok(root) => root,
            Err(e) => return Err(vec![format!("XML syntax error: {}", e)]),
        };

        match root {
            Some(root) if schema.roots.contains(&root) => Ok(()),
            Some(root) => Err(vec![format!(
                "root element <{}> is not declared by schema {} (expected one of {:?})",
                root, schema_name, schema.roots
            )]),
            None => Err(vec!["document has no root element".into()]),
        }
    }

    /// Fetch an XSD from the repository and add it to the local schema
    /// set. Used when a collection ships its schema alongside the data.
    pub async fn fetch_schema(
        &mut self,
        client: &reqwest::Client,
        schema_url: &str,
        schema_name: &str,
    ) -> anyhow::Result<()> {
        let response = client
            .get(schema_url)
            .send()
            .await
            .context(format!("could not fetch schema from {}", schema_url))?;

        if !response.status().is_success() {
            return Err(IngestError::from_status(response.status(), schema_url).into());
        }

        let content = response.text().await?;
        let path = self.schema_dir.join(format!("{}.xsd", schema_name));
        fs::write(&path, content).context(format!("could not write schema {:?}", path))?;
        self.load_schemas()
    }
}

/// Top-level `xs:element` declarations of an XSD, namespace prefix
/// ignored. Only elements directly under the schema root count.
fn parse_schema_roots(xsd: &str) -> anyhow::Result<HashSet<String>> {
    let mut reader = Reader::from_str(xsd);
    reader.trim_text(true);

    let mut roots = HashSet::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 2 && local_name(e.name().as_ref()) == "element" {
                    if let Some(name) = attribute_value(&e, b"name") {
                        roots.insert(name);
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 && local_name(e.name().as_ref()) == "element" {
                    if let Some(name) = attribute_value(&e, b"name") {
                        roots.insert(name);
                    }
                }
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(anyhow::anyhow!("invalid XSD: {}", e)),
        }
    }
    Ok(roots)
}

/// Read every event to confirm well-formedness; return the root element's
/// local name.
fn well_formed_root(content: &str) -> Result<Option<String>, quick_xml::Error> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut root = None;
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if root.is_none() {
                    root = Some(local_name(e.name().as_ref()).to_string());
                }
            }
            Event::Empty(e) => {
                if root.is_none() {
                    root = Some(local_name(e.name().as_ref()).to_string());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(root)
}

fn local_name(name: &[u8]) -> &str {
    let raw = std::str::from_utf8(name).unwrap_or("");
    raw.rsplit(':').next().unwrap_or(raw)
}

fn attribute_value(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

#[cfg(test)]
mod test {
    use super::*;

    const BILL_XSD: &str = r#"<?xml version="1.0"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="bill">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="congress" type="xs:string"/>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
  <xs:element name="resolution" type="xs:string"/>
</xs:schema>"#;

    fn validator_with_bill_schema() -> (XmlValidator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bills.xsd"), BILL_XSD).unwrap();
        let validator = XmlValidator::new(dir.path()).unwrap();
        (validator, dir)
    }

    #[test]
    fn schema_roots_are_top_level_only() {
        let roots = parse_schema_roots(BILL_XSD).unwrap();
        assert!(roots.contains("bill"));
        assert!(roots.contains("resolution"));
        // nested declaration does not count as a document root
        assert!(!roots.contains("congress"));
    }

    #[test]
    fn accepts_matching_root() {
        let (validator, _dir) = validator_with_bill_schema();
        assert!(validator
            .validate("<bill><congress>118</congress></bill>", "bills")
            .is_ok());
    }

    #[test]
    fn rejects_wrong_root() {
        let (validator, _dir) = validator_with_bill_schema();
        let errors = validator
            .validate("<notabill/>", "bills")
            .unwrap_err();
        assert!(errors[0].contains("notabill"));
    }

    #[test]
    fn rejects_malformed_xml() {
        let (validator, _dir) = validator_with_bill_schema();
        let errors = validator
            .validate("<bill><congress>118</bill>", "bills")
            .unwrap_err();
        assert!(errors[0].contains("XML syntax error"));
    }

    #[test]
    fn unknown_schema_is_an_error() {
        let (validator, _dir) = validator_with_bill_schema();
        assert!(validator.validate("<bill/>", "statute").is_err());
        assert!(!validator.has_schema("statute"));
        assert!(validator.has_schema("bills"));
    }
}

//! C1: the DwC mapping registry.
//!
//! Parses GBIF extension XML descriptors and answers questions about
//! which extension owns a term and what its fully-qualified URI is.

use std::sync::Mutex;

use lazy_static::lazy_static;
use quick_xml::de::from_str;

use crate::prelude::*;

#[derive(Debug, Deserialize)]
struct ExtensionXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@rowType")]
    row_type: String,
    #[serde(rename = "property", default)]
    properties: Vec<PropertyXml>,
}

#[derive(Debug, Deserialize)]
struct PropertyXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@qualName")]
    qual_name: String,
    #[serde(rename = "@required", default)]
    required: bool,
}

/// A single property defined by a DwC extension.
#[derive(Debug, Clone)]
pub struct Term {
    /// Short name, e.g. `basisOfRecord`.
    pub name: String,
    /// Fully-qualified URI, e.g.
    /// `http://rs.tdwg.org/dwc/terms/basisOfRecord`.
    pub qualified_name: String,
    /// Whether the upstream schema marks this term required.
    pub required: bool,
}

/// One parsed GBIF extension descriptor: a human name, a row type URI,
/// and an ordered list of terms.
#[derive(Debug, Clone)]
pub struct Extension {
    name: String,
    row_type: String,
    terms: Vec<Term>,
}

impl Extension {
    fn parse(xml: &str) -> Result<Extension> {
        let raw: ExtensionXml =
            from_str(xml).context("could not parse DwC extension descriptor")?;
        Ok(Extension {
            name: raw.name,
            row_type: raw.row_type,
            terms: raw
                .properties
                .into_iter()
                .map(|p| Term {
                    name: p.name,
                    qualified_name: p.qual_name,
                    required: p.required,
                })
                .collect(),
        })
    }
}

lazy_static! {
    static ref EXTENSION_CACHE: Mutex<HashMap<PathBuf, Extension>> = Mutex::new(HashMap::new());
}

fn load_cached(path: &Path) -> Result<Extension> {
    let mut cache = EXTENSION_CACHE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(ext) = cache.get(path) {
        return Ok(ext.clone());
    }
    let xml = std::fs::read_to_string(path)
        .with_context(|| format!("could not read DwC extension file {}", path.display()))?;
    let ext = Extension::parse(&xml)
        .with_context(|| format!("could not parse DwC extension file {}", path.display()))?;
    cache.insert(path.to_owned(), ext.clone());
    Ok(ext)
}

/// The registry of known DwC extensions, built once from a core extension
/// file and zero or more additional extension files. The first extension
/// loaded is the core; if a term name is declared by more than one
/// extension, the first registration wins.
#[derive(Debug, Clone)]
pub struct Registry {
    extensions: Vec<Extension>,
    term_owner: HashMap<String, usize>,
}

impl Registry {
    /// Build a registry from a core extension path and any number of
    /// additional extension paths, in order.
    pub fn load(core: &Path, additional: &[PathBuf]) -> Result<Registry> {
        let mut extensions = Vec::with_capacity(1 + additional.len());
        extensions.push(load_cached(core)?);
        for path in additional {
            extensions.push(load_cached(path)?);
        }

        let mut term_owner = HashMap::new();
        for (index, ext) in extensions.iter().enumerate() {
            for term in &ext.terms {
                term_owner.entry(term.name.clone()).or_insert(index);
            }
        }

        Ok(Registry {
            extensions,
            term_owner,
        })
    }

    /// Extension names in registration order, core first.
    pub fn extensions(&self) -> Vec<&str> {
        self.extensions.iter().map(|e| e.name.as_str()).collect()
    }

    /// Whether `extension` is the core extension (the first one loaded).
    pub fn is_core(&self, extension: &str) -> bool {
        self.extensions
            .first()
            .map(|e| e.name == extension)
            .unwrap_or(false)
    }

    /// Whether `extension` was loaded into this registry.
    pub fn has(&self, extension: &str) -> bool {
        self.find(extension).is_some()
    }

    /// The row type URI of `extension`, if known.
    pub fn row_type(&self, extension: &str) -> Option<&str> {
        self.find(extension).map(|e| e.row_type.as_str())
    }

    /// Terms declared by `extension`, in declaration order.
    pub fn terms(&self, extension: &str) -> Vec<&Term> {
        self.find(extension)
            .map(|e| e.terms.iter().collect())
            .unwrap_or_default()
    }

    /// Whether `term` is known to any loaded extension.
    pub fn term_exists(&self, term: &str) -> bool {
        self.term_owner.contains_key(term)
    }

    /// The extension that owns `term` (first registration wins).
    pub fn term_extension(&self, term: &str) -> Option<&str> {
        self.term_owner
            .get(term)
            .map(|&i| self.extensions[i].name.as_str())
    }

    /// The fully-qualified URI of `term`, if known.
    pub fn term_qualified(&self, term: &str) -> Option<&str> {
        let index = *self.term_owner.get(term)?;
        self.extensions[index]
            .terms
            .iter()
            .find(|t| t.name == term)
            .map(|t| t.qualified_name.as_str())
    }

    fn find(&self, extension: &str) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.name == extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_extension(dir: &tempfile::TempDir, file: &str, xml: &str) -> PathBuf {
        let path = dir.path().join(file);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(xml.as_bytes()).unwrap();
        path
    }

    const OCCURRENCE: &str = r#"
        <extension name="Occurrence" rowType="http://rs.tdwg.org/dwc/terms/Occurrence">
            <property name="basisOfRecord" qualName="http://rs.tdwg.org/dwc/terms/basisOfRecord" required="true"/>
            <property name="eventDate" qualName="http://rs.tdwg.org/dwc/terms/eventDate" required="false"/>
        </extension>
    "#;

    const MEASUREMENT: &str = r#"
        <extension name="MeasurementOrFact" rowType="http://rs.tdwg.org/dwc/terms/MeasurementOrFact">
            <property name="measurementRemarks" qualName="http://rs.tdwg.org/dwc/terms/measurementRemarks" required="false"/>
            <property name="basisOfRecord" qualName="http://example.org/bogus" required="false"/>
        </extension>
    "#;

    #[test]
    fn first_registration_wins_on_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let core = write_extension(&dir, "occurrence.xml", OCCURRENCE);
        let additional = write_extension(&dir, "measurement.xml", MEASUREMENT);

        let registry = Registry::load(&core, &[additional]).unwrap();
        assert!(registry.is_core("Occurrence"));
        assert!(!registry.is_core("MeasurementOrFact"));
        assert_eq!(registry.term_extension("basisOfRecord"), Some("Occurrence"));
        assert_eq!(
            registry.term_qualified("basisOfRecord"),
            Some("http://rs.tdwg.org/dwc/terms/basisOfRecord")
        );
    }

    #[test]
    fn unknown_term_reports_absent() {
        let dir = tempfile::tempdir().unwrap();
        let core = write_extension(&dir, "occurrence.xml", OCCURRENCE);
        let registry = Registry::load(&core, &[]).unwrap();
        assert!(!registry.term_exists("somethingElse"));
        assert_eq!(registry.term_extension("somethingElse"), None);
    }
}

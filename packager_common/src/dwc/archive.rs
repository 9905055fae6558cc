//! C2: the archive layout builder.
//!
//! Accumulates, while walking the upstream field list, which CSV files the
//! output archive will contain and which input fields feed which output
//! terms.

use std::collections::HashSet;

use crate::prelude::*;

/// One input field's contribution to an (extension, term) cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldContribution {
    /// Upstream field name this contribution reads from.
    pub input_field: String,
    /// Sub-field within `input_field`'s decoded JSON value, if any.
    pub sub_field: Option<String>,
    /// Named formatter to apply to the raw value, if any.
    pub formatter: Option<String>,
    /// Default value to use when the decoded item has no `sub_field` key
    /// at all, configured per extension-field sub-field.
    pub default: Option<String>,
}

type Key = (String, String, Option<String>, Option<String>, Option<String>);

/// In-memory model of the DwC-A being assembled: an ordered mapping
/// extension name to an ordered mapping term name to the list of input
/// fields contributing to it.
#[derive(Debug, Clone, Default)]
pub struct ArchiveLayout {
    extensions: Vec<String>,
    terms: HashMap<String, Vec<String>>,
    fields: HashMap<(String, String), Vec<FieldContribution>>,
    seen: HashSet<Key>,
}

impl ArchiveLayout {
    /// Create an empty layout.
    pub fn new() -> ArchiveLayout {
        ArchiveLayout::default()
    }

    /// Register that `input_field` (optionally reading only `sub_field` of
    /// its decoded value, optionally through `formatter`, falling back to
    /// `default` when the decoded item has no `sub_field` key) contributes
    /// to `term` within `extension`. Calling this twice with the same
    /// tuple is a no-op.
    #[allow(clippy::too_many_arguments)]
    pub fn add_term(
        &mut self,
        input_field: &str,
        sub_field: Option<&str>,
        extension: &str,
        term: &str,
        formatter: Option<&str>,
        default: Option<&str>,
    ) {
        let key: Key = (
            input_field.to_owned(),
            extension.to_owned(),
            sub_field.map(|s| s.to_owned()),
            Some(term.to_owned()),
            formatter.map(|f| f.to_owned()),
        );
        if !self.seen.insert(key) {
            return;
        }

        if !self.extensions.iter().any(|e| e == extension) {
            self.extensions.push(extension.to_owned());
        }
        let terms = self.terms.entry(extension.to_owned()).or_default();
        if !terms.iter().any(|t| t == term) {
            terms.push(term.to_owned());
        }
        self.fields
            .entry((extension.to_owned(), term.to_owned()))
            .or_default()
            .push(FieldContribution {
                input_field: input_field.to_owned(),
                sub_field: sub_field.map(|s| s.to_owned()),
                formatter: formatter.map(|f| f.to_owned()),
                default: default.map(|d| d.to_owned()),
            });
    }

    /// Extensions discovered so far, in first-use order.
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Terms discovered for `extension`, in discovery order.
    pub fn terms(&self, extension: &str) -> &[String] {
        self.terms
            .get(extension)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// The contributions feeding `(extension, term)`, in registration
    /// order.
    pub fn term_fields(&self, extension: &str, term: &str) -> &[FieldContribution] {
        self.fields
            .get(&(extension.to_owned(), term.to_owned()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// The CSV file name an extension is written to: its name converted
    /// to `snake_case` with a `.csv` suffix.
    pub fn file_name(extension: &str) -> String {
        format!("{}.csv", snake_case(extension))
    }
}

/// Split a camel-case or Pascal-case name into lowercased, underscore
/// joined words, e.g. `MeasurementOrFact` -> `measurement_or_fact`.
fn snake_case(name: &str) -> String {
    let mut words = Vec::new();
    let mut current = String::new();
    for c in name.chars() {
        if c.is_uppercase() && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
        .into_iter()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_term_is_idempotent() {
        let mut layout = ArchiveLayout::new();
        layout.add_term("basisOfRecord", None, "Occurrence", "basisOfRecord", None, None);
        layout.add_term("basisOfRecord", None, "Occurrence", "basisOfRecord", None, None);
        assert_eq!(layout.terms("Occurrence"), &["basisOfRecord".to_owned()]);
        assert_eq!(layout.term_fields("Occurrence", "basisOfRecord").len(), 1);
    }

    #[test]
    fn several_fields_can_share_one_term() {
        let mut layout = ArchiveLayout::new();
        layout.add_term("remarks_en", None, "Occurrence", "occurrenceRemarks", None, None);
        layout.add_term("remarks_fr", None, "Occurrence", "occurrenceRemarks", None, None);
        assert_eq!(layout.term_fields("Occurrence", "occurrenceRemarks").len(), 2);
    }

    #[test]
    fn file_name_converts_camel_case() {
        assert_eq!(ArchiveLayout::file_name("Occurrence"), "occurrence.csv");
        assert_eq!(
            ArchiveLayout::file_name("MeasurementOrFact"),
            "measurement_or_fact.csv"
        );
    }

    #[test]
    fn extensions_are_ordered_by_first_use() {
        let mut layout = ArchiveLayout::new();
        layout.add_term("a", None, "MeasurementOrFact", "t1", None, None);
        layout.add_term("b", None, "Occurrence", "basisOfRecord", None, None);
        assert_eq!(
            layout.extensions(),
            &["MeasurementOrFact".to_owned(), "Occurrence".to_owned()]
        );
    }
}

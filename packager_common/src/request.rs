//! Request descriptors: the validated bag of fields produced by ingress
//! from an incoming form, before a [`crate::task::PackageTask`] is built
//! from them.

use crate::prelude::*;

/// Output format for the datastore and DwC variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Comma-separated values.
    Csv,
    /// Tab-separated values.
    Tsv,
    /// Excel spreadsheet.
    Xlsx,
}

impl Default for Format {
    fn default() -> Self {
        Format::Csv
    }
}

impl Format {
    /// The field delimiter used by the CSV writer for this format. `xlsx`
    /// is written as CSV first and converted afterwards, so it shares the
    /// comma delimiter.
    pub fn delimiter(self) -> u8 {
        match self {
            Format::Csv | Format::Xlsx => b',',
            Format::Tsv => b'\t',
        }
    }

    /// The extension a writer's working file should carry before any
    /// format-specific finalisation step runs.
    pub fn working_extension(self) -> &'static str {
        match self {
            Format::Csv | Format::Xlsx => "csv",
            Format::Tsv => "tsv",
        }
    }
}

/// Fields shared by every request variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Common {
    /// Identifier of the upstream resource being exported.
    pub resource_id: String,
    /// Address the finished archive link is mailed to.
    pub email: String,
}

/// A validated request to export a resource through the upstream search
/// API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreRequest {
    /// Fields required by every variant.
    #[serde(flatten)]
    pub common: Common,
    /// Absolute URL of the upstream search endpoint.
    pub api_url: String,
    /// Optional bearer token forwarded to the upstream endpoint.
    pub key: Option<String>,
    /// Free-form filter object forwarded to the upstream endpoint verbatim.
    pub filters: Option<serde_json::Value>,
    /// Free-text search term.
    pub q: Option<String>,
    /// Whether `q` should be treated as plain text by the upstream search.
    pub plain: Option<bool>,
    /// Restrict the search to a language.
    pub language: Option<String>,
    /// Restrict the returned columns.
    pub fields: Option<Vec<String>>,
    /// Sort expression forwarded to the upstream endpoint.
    pub sort: Option<String>,
    /// Maximum number of records to fetch; `None` means "all".
    pub limit: Option<u64>,
    /// Starting offset.
    pub offset: Option<u64>,
    /// Desired output format.
    #[serde(default)]
    pub format: Format,
    /// Digital Object Identifier to cite in the delivery email.
    pub doi: Option<String>,
}

/// A validated request to package an arbitrary URL's contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRequest {
    /// Fields required by every variant.
    #[serde(flatten)]
    pub common: Common,
    /// Absolute URL to fetch and store verbatim.
    pub resource_url: String,
    /// Optional bearer token forwarded when fetching the URL.
    pub key: Option<String>,
}

/// A validated request to package a resource as a Darwin Core Archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DwcRequest {
    /// Every field available to the datastore variant is also forwarded
    /// when fetching records for a DwC-A job.
    #[serde(flatten)]
    pub datastore: DatastoreRequest,
    /// Optional EML metadata template, formatted and included as
    /// `eml.xml` when present.
    pub eml: Option<String>,
}

/// One of the three request shapes accepted by ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Request {
    /// See [`DatastoreRequest`].
    Datastore(DatastoreRequest),
    /// See [`UrlRequest`].
    Url(UrlRequest),
    /// See [`DwcRequest`].
    Dwc(DwcRequest),
}

impl Request {
    /// Fields shared by every variant, used for cache fingerprinting and
    /// statistics logging.
    pub fn common(&self) -> &Common {
        match self {
            Request::Datastore(r) => &r.common,
            Request::Url(r) => &r.common,
            Request::Dwc(r) => &r.datastore.common,
        }
    }

    /// Validate the invariants from the request descriptor: required
    /// fields non-empty, `filters` (if present) a JSON object, `limit`
    /// and `offset` non-negative (guaranteed by the unsigned type, kept
    /// here so the check has a single home and a clear error message).
    pub fn validate(&self) -> Result<()> {
        let common = self.common();
        if common.resource_id.trim().is_empty() {
            return Err(format_err!("resource_id is required"));
        }
        if common.email.trim().is_empty() {
            return Err(format_err!("email is required"));
        }
        let filters = match self {
            Request::Datastore(r) => r.filters.as_ref(),
            Request::Dwc(r) => r.datastore.filters.as_ref(),
            Request::Url(_) => None,
        };
        if let Some(filters) = filters {
            if !filters.is_object() {
                return Err(format_err!("filters must be a JSON object"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datastore(resource_id: &str, email: &str) -> DatastoreRequest {
        DatastoreRequest {
            common: Common {
                resource_id: resource_id.to_owned(),
                email: email.to_owned(),
            },
            api_url: "http://catalog.example.org/search".to_owned(),
            key: None,
            filters: None,
            q: None,
            plain: None,
            language: None,
            fields: None,
            sort: None,
            limit: None,
            offset: None,
            format: Format::Csv,
            doi: None,
        }
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let req = Request::Datastore(datastore("", "a@x.com"));
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_object_filters() {
        let mut d = datastore("r1", "a@x.com");
        d.filters = Some(serde_json::json!(["not", "an", "object"]));
        assert!(Request::Datastore(d).validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_request() {
        let mut d = datastore("r1", "a@x.com");
        d.filters = Some(serde_json::json!({"type": "bird"}));
        assert!(Request::Datastore(d).validate().is_ok());
    }
}

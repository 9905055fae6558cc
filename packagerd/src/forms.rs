//! Converts the flat, string-valued form bodies the ingress endpoints
//! accept into the typed [`Request`] variants the pipeline engine
//! understands.

use packager_common::request::{Common, DatastoreRequest, DwcRequest, Format, UrlRequest};
use serde::Deserialize;

use crate::util::IngressError;

/// The union of every field any package endpoint might receive. Axum's
/// `Form` extractor deserialises url-encoded bodies into this directly;
/// each handler then picks the subset its variant needs.
#[derive(Debug, Deserialize)]
pub struct RawForm {
    pub secret: Option<String>,
    pub resource_id: Option<String>,
    pub email: Option<String>,
    pub api_url: Option<String>,
    pub resource_url: Option<String>,
    pub key: Option<String>,
    pub filters: Option<String>,
    pub q: Option<String>,
    pub plain: Option<String>,
    pub language: Option<String>,
    pub fields: Option<String>,
    pub sort: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub format: Option<String>,
    pub doi: Option<String>,
    pub eml: Option<String>,
}

/// Body shape for `/statistics`, `/statistics/requests`, and
/// `/statistics/errors`.
#[derive(Debug, Deserialize)]
pub struct StatsForm {
    pub secret: Option<String>,
    pub resource_id: Option<String>,
    pub email: Option<String>,
    pub offset: Option<String>,
    pub limit: Option<String>,
}

fn require(value: &Option<String>, name: &str) -> Result<String, IngressError> {
    match value {
        Some(s) if !s.trim().is_empty() => Ok(s.clone()),
        _ => Err(PackageErrorLike::bad_request(format!("{name} is required"))),
    }
}

fn parse_bool(value: &Option<String>) -> Option<bool> {
    value.as_deref().and_then(|s| match s {
        "1" | "true" | "True" => Some(true),
        "0" | "false" | "False" => Some(false),
        _ => None,
    })
}

pub fn parse_u64(value: &Option<String>, name: &str) -> Result<Option<u64>, IngressError> {
    match value {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| PackageErrorLike::bad_request(format!("{name} must be a non-negative integer"))),
    }
}

fn parse_format(value: &Option<String>) -> Result<Format, IngressError> {
    match value.as_deref() {
        None | Some("") | Some("csv") => Ok(Format::Csv),
        Some("tsv") => Ok(Format::Tsv),
        Some("xlsx") => Ok(Format::Xlsx),
        Some(other) => Err(PackageErrorLike::bad_request(format!(
            "unknown format {other:?}"
        ))),
    }
}

fn parse_filters(value: &Option<String>) -> Result<Option<serde_json::Value>, IngressError> {
    match value {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => serde_json::from_str(s)
            .map(Some)
            .map_err(|e| PackageErrorLike::bad_request(format!("filters is not valid JSON: {e}"))),
    }
}

fn parse_fields(value: &Option<String>) -> Option<Vec<String>> {
    value.as_ref().map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_owned)
            .collect()
    })
}

/// Helper so this module can build an [`IngressError`] without importing
/// `PackageError` directly at every call site.
struct PackageErrorLike;

impl PackageErrorLike {
    fn bad_request(message: impl Into<String>) -> IngressError {
        packager_common::error::PackageError::BadRequest(message.into()).into()
    }
}

pub fn datastore_request(form: &RawForm) -> Result<DatastoreRequest, IngressError> {
    Ok(DatastoreRequest {
        common: Common {
            resource_id: require(&form.resource_id, "resource_id")?,
            email: require(&form.email, "email")?,
        },
        api_url: require(&form.api_url, "api_url")?,
        key: form.key.clone(),
        filters: parse_filters(&form.filters)?,
        q: form.q.clone(),
        plain: parse_bool(&form.plain),
        language: form.language.clone(),
        fields: parse_fields(&form.fields),
        sort: form.sort.clone(),
        limit: parse_u64(&form.limit, "limit")?,
        offset: parse_u64(&form.offset, "offset")?,
        format: parse_format(&form.format)?,
        doi: form.doi.clone(),
    })
}

pub fn url_request(form: &RawForm) -> Result<UrlRequest, IngressError> {
    Ok(UrlRequest {
        common: Common {
            resource_id: require(&form.resource_id, "resource_id")?,
            email: require(&form.email, "email")?,
        },
        resource_url: require(&form.resource_url, "resource_url")?,
        key: form.key.clone(),
    })
}

pub fn dwc_request(form: &RawForm) -> Result<DwcRequest, IngressError> {
    Ok(DwcRequest {
        datastore: datastore_request(form)?,
        eml: form.eml.clone(),
    })
}

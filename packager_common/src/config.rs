//! Configuration consumed by the pipeline engine.
//!
//! Loading this from the environment, validating directories exist, and
//! wiring it into the ingress HTTP server is the job of `packagerd`; this
//! module only defines the shape of the configuration and a couple of
//! small derived helpers the engine itself needs.

use std::path::PathBuf;
use std::time::Duration;

use crate::prelude::*;

/// Runtime configuration for the packaging pipeline.
///
/// Field names mirror the environment variable keys in the specification
/// (`HOST`, `PORT`, ... `DWC_EXTENSION_FIELDS`), translated to idiomatic
/// snake_case.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of workers in the "fast" pool.
    pub workers: usize,
    /// Number of tasks a worker processes before being recycled. `0` means
    /// never recycle.
    pub requests_per_worker: usize,
    /// Page size requested from the upstream search endpoint.
    pub page_size: u64,
    /// Row-count threshold above which a datastore request is classified
    /// `slow` rather than `fast`.
    pub slow_request: u64,

    /// Directory in which finished archives are stored and cached.
    pub store_directory: PathBuf,
    /// Directory under which per-job scratch workspaces are created.
    pub temp_directory: PathBuf,
    /// How long a cached archive remains valid.
    pub cache_time: Duration,

    /// Shell command template used to build the final ZIP, with `{input}`
    /// and `{output}` placeholders.
    pub zip_command: String,

    /// SMTP relay host.
    pub smtp_host: String,
    /// SMTP relay port.
    pub smtp_port: u16,
    /// Optional SMTP auth login.
    pub smtp_login: Option<String>,
    /// Optional SMTP auth password.
    pub smtp_password: Option<String>,

    /// `{placeholder}` template for the email subject line.
    pub email_subject: String,
    /// `{placeholder}` template for the `From:` header.
    pub email_from: String,
    /// `{placeholder}` template for the plain-text email body.
    pub email_body: String,
    /// `{placeholder}` template for the HTML email body.
    pub email_body_html: String,
    /// `{placeholder}` template for the plain-text DOI paragraph.
    pub doi_body: String,
    /// `{placeholder}` template for the HTML DOI paragraph.
    pub doi_body_html: String,

    /// Connection string for the statistics store (a filesystem path for
    /// the embedded SQLite backend).
    pub stats_db: String,
    /// Whether emails are hashed before being written to the statistics
    /// store.
    pub anonymize_emails: bool,

    /// Path to the XML file describing the core DwC extension.
    pub dwc_core_extension: PathBuf,
    /// Paths to XML files describing additional DwC extensions.
    pub dwc_additional_extensions: Vec<PathBuf>,
    /// Term name used for the dynamic-properties catch-all column.
    pub dwc_dynamic_term: String,
    /// Upstream field name carrying the record id, excluded from routing.
    pub dwc_id_field: String,
    /// Extension-field configuration: input field name to the extension
    /// and sub-field mapping it expands into.
    pub dwc_extension_fields: Vec<ExtensionFieldConfig>,
}

/// Describes one upstream field that expands into its own DwC extension,
/// e.g. a JSON-encoded list of measurements.
#[derive(Debug, Clone)]
pub struct ExtensionFieldConfig {
    /// Name of the upstream field carrying the JSON payload.
    pub input_field: String,
    /// Extension the expanded rows belong to.
    pub extension: String,
    /// Sub-fields found inside each JSON object, mapped to
    /// `(term, formatter)`.
    pub sub_fields: HashMap<String, SubFieldConfig>,
}

/// One sub-field of an [`ExtensionFieldConfig`].
#[derive(Debug, Clone)]
pub struct SubFieldConfig {
    /// DwC term this sub-field is written under.
    pub term: String,
    /// Optional named formatter applied to the value before writing.
    pub formatter: Option<String>,
    /// Default value merged in when a decoded item has no key for this
    /// sub-field at all.
    pub default: Option<String>,
}

impl Config {
    /// Resolve a flat `requests` limit to pass to [`crate::stats`], used by
    /// [`crate::task`] when logging a successful job.
    pub fn is_anonymized(&self) -> bool {
        self.anonymize_emails
    }

    /// Load configuration from the environment variable keys listed in the
    /// specification. Required keys missing from the environment are a
    /// hard error; optional keys fall back to sensible defaults.
    pub fn from_env() -> Result<Config> {
        Ok(Config {
            workers: env_parse("WORKERS", 4)?,
            requests_per_worker: env_parse("REQUESTS_PER_WORKER", 0)?,
            page_size: env_parse("PAGE_SIZE", 500)?,
            slow_request: env_parse("SLOW_REQUEST", 10_000)?,

            store_directory: PathBuf::from(env_required("STORE_DIRECTORY")?),
            temp_directory: PathBuf::from(env_required("TEMP_DIRECTORY")?),
            cache_time: Duration::from_secs(env_parse("CACHE_TIME", 86_400)?),

            zip_command: env_or("ZIP_COMMAND", "zip -j {output} {input}"),

            smtp_host: env_required("SMTP_HOST")?,
            smtp_port: env_parse("SMTP_PORT", 25)?,
            smtp_login: std::env::var("SMTP_LOGIN").ok(),
            smtp_password: std::env::var("SMTP_PASSWORD").ok(),

            email_subject: env_required("EMAIL_SUBJECT")?,
            email_from: env_required("EMAIL_FROM")?,
            email_body: env_required("EMAIL_BODY")?,
            email_body_html: env_required("EMAIL_BODY_HTML")?,
            doi_body: env_or("DOI_BODY", ""),
            doi_body_html: env_or("DOI_BODY_HTML", ""),

            stats_db: env_required("STATS_DB")?,
            anonymize_emails: env_parse("ANONYMIZE_EMAILS", false)?,

            dwc_core_extension: PathBuf::from(env_required("DWC_CORE_EXTENSION")?),
            dwc_additional_extensions: env_path_list("DWC_ADDITIONAL_EXTENSIONS"),
            dwc_dynamic_term: env_or("DWC_DYNAMIC_TERM", "dynamicProperties"),
            dwc_id_field: env_or("DWC_ID_FIELD", "_id"),
            dwc_extension_fields: parse_extension_fields(&env_or("DWC_EXTENSION_FIELDS", "")),
        })
    }

    /// Shared secret checked by the ingress façade, and the host/port it
    /// listens on. Kept separate from the rest of the struct since only
    /// `packagerd`'s entry point needs them.
    pub fn ingress_settings() -> Result<(String, String, String)> {
        Ok((
            env_or("HOST", "0.0.0.0"),
            env_or("PORT", "8080"),
            env_required("SECRET")?,
        ))
    }
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| format_err!("could not parse {key}={value:?}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_path_list(key: &str) -> Vec<PathBuf> {
    std::env::var(key)
        .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(PathBuf::from).collect())
        .unwrap_or_default()
}

/// Parse `DWC_EXTENSION_FIELDS`, a JSON array of objects shaped like
/// `{"input_field": "...", "extension": "...", "sub_fields": {"key": {"term": "...", "formatter": "...", "default": "..."}}}`.
/// `default` carries the value merged into each decoded item when the
/// item itself has no key for that sub-field.
fn parse_extension_fields(raw: &str) -> Vec<ExtensionFieldConfig> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    #[derive(Deserialize)]
    struct RawSubField {
        term: String,
        formatter: Option<String>,
        default: Option<String>,
    }
    #[derive(Deserialize)]
    struct RawExtensionField {
        input_field: String,
        extension: String,
        sub_fields: HashMap<String, RawSubField>,
    }
    let parsed: Vec<RawExtensionField> = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    parsed
        .into_iter()
        .map(|r| ExtensionFieldConfig {
            input_field: r.input_field,
            extension: r.extension,
            sub_fields: r
                .sub_fields
                .into_iter()
                .map(|(k, v)| {
                    (
                        k,
                        SubFieldConfig {
                            term: v.term,
                            formatter: v.formatter,
                            default: v.default,
                        },
                    )
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
pub fn sample() -> Config {
    Config {
        workers: 2,
        requests_per_worker: 0,
        page_size: 500,
        slow_request: 10_000,
        store_directory: PathBuf::from("/tmp/packager-store"),
        temp_directory: PathBuf::from("/tmp/packager-work"),
        cache_time: Duration::from_secs(86_400),
        zip_command: "zip -j {output} {input}".to_owned(),
        smtp_host: "localhost".to_owned(),
        smtp_port: 25,
        smtp_login: None,
        smtp_password: None,
        email_subject: "Your {resource_id} export is ready".to_owned(),
        email_from: "packager@example.org".to_owned(),
        email_body: "Download: {zip_file_name}".to_owned(),
        email_body_html: "<p>Download: {zip_file_name}</p>".to_owned(),
        doi_body: "Please cite {doi}.".to_owned(),
        doi_body_html: "<p>Please cite {doi}.</p>".to_owned(),
        stats_db: ":memory:".to_owned(),
        anonymize_emails: false,
        dwc_core_extension: PathBuf::from("occurrence.xml"),
        dwc_additional_extensions: vec![],
        dwc_dynamic_term: "dynamicProperties".to_owned(),
        dwc_id_field: "_id".to_owned(),
        dwc_extension_fields: vec![],
    }
}

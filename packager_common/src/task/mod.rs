//! C6: the package task state machine.
//!
//! The three request variants share one driver (`run`) and differ only in
//! how they populate a [`Workspace`](crate::workspace::Workspace) before
//! the shared driver emails the requester and logs the outcome. Modelled
//! as a tagged sum type over [`crate::request::Request`] rather than
//! inheritance, per the shared-driver design note.

mod datastore;
mod dwc;
mod url;

use std::sync::Arc;

use crate::config::Config;
use crate::dwc::Registry;
use crate::email::{self, SmtpConfig};
use crate::error::PackageError;
use crate::fingerprint::fingerprint;
use crate::prelude::*;
use crate::request::Request;
use crate::stats::StatsStore;
use crate::workspace::{self, Workspace};

/// Everything a running task needs beyond the request descriptor itself.
#[derive(Clone)]
pub struct TaskEnv {
    pub config: Arc<Config>,
    pub stats: Arc<StatsStore>,
    pub registry: Option<Arc<Registry>>,
    pub http: reqwest::Client,
}

/// Which worker pool a task should be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Fast,
    Slow,
}

/// Classify a request for routing to the fast or slow pool. A request
/// whose archive is already cached is always fast. Otherwise the
/// datastore and DwC variants classify by the number of rows requested
/// against [`Config::slow_request`]; the URL variant is always fast (a
/// single-file fetch carries none of the per-row ingestion cost the
/// threshold is meant to bound).
pub fn speed(request: &Request, config: &Config) -> Result<Speed> {
    let fp = fingerprint(request)?;
    let cached =
        workspace::find_cached_archive(&config.store_directory, &fp, config.cache_time)?.is_some();
    if cached {
        return Ok(Speed::Fast);
    }
    let requested = match request {
        Request::Datastore(d) => d.limit,
        Request::Dwc(d) => d.datastore.limit,
        Request::Url(_) => return Ok(Speed::Fast),
    };
    Ok(match requested {
        Some(limit) if limit <= config.slow_request => Speed::Fast,
        None => Speed::Slow,
        Some(_) => Speed::Slow,
    })
}

/// The upstream host a request talks to, used as an email placeholder.
pub fn host(request: &Request) -> String {
    let url_str = match request {
        Request::Datastore(d) => &d.api_url,
        Request::Dwc(d) => &d.datastore.api_url,
        Request::Url(u) => &u.resource_url,
    };
    ::url::Url::parse(url_str)
        .ok()
        .and_then(|u| u.host_str().map(|s| s.to_owned()))
        .unwrap_or_default()
}

/// Run one package task end to end: validate, check the cache, ingest,
/// write, zip, email, and log the outcome. Errors are recorded via the
/// statistics store and re-raised so the worker pool can log them; no
/// email is sent for a failed job.
#[instrument(skip_all, level = "info", fields(resource_id = %request.common().resource_id))]
pub async fn run(request: Request, env: TaskEnv) -> Result<()> {
    request.validate().map_err(|e| PackageError::BadRequest(e.to_string()))?;
    let common = request.common().clone();

    match run_inner(&request, &env).await {
        Ok(zip_file_name) => {
            let requested_count = match &request {
                Request::Datastore(d) => d.limit.map(|l| l as i64),
                Request::Dwc(d) => d.datastore.limit.map(|l| l as i64),
                Request::Url(_) => None,
            };
            env.stats
                .log_request(&common.resource_id, &common.email, requested_count)
                .context("could not record successful request")?;
            debug!(%zip_file_name, "package task finished");
            Ok(())
        }
        Err(e) => {
            env.stats
                .log_error(&common.resource_id, &common.email, &format!("{e:#}"))
                .context("could not record failed request")?;
            Err(e)
        }
    }
}

async fn run_inner(request: &Request, env: &TaskEnv) -> Result<String> {
    let fp = fingerprint(request)?;

    if let Some(existing) =
        workspace::find_cached_archive(&env.config.store_directory, &fp, env.config.cache_time)?
    {
        let name = existing
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        deliver_and_name(request, env, name.clone()).await?;
        return Ok(name);
    }

    let mut workspace = Workspace::create(&env.config.temp_directory)?;
    let archive_path = match request {
        Request::Datastore(r) => {
            datastore::create_zip(r, &mut workspace, env, &fp).await
        }
        Request::Url(r) => url::create_zip(r, &mut workspace, env, &fp).await,
        Request::Dwc(r) => dwc::create_zip(r, &mut workspace, env, &fp).await,
    };
    // Workspace cleanup is guaranteed by `Workspace`'s `Drop` regardless of
    // which branch above returned, so only the success path needs to call
    // `clean_work_files` explicitly for clear timing in logs/tests.
    let archive_path = archive_path?;
    workspace.clean_work_files().ok();

    let name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    deliver_and_name(request, env, name.clone()).await?;
    Ok(name)
}

async fn deliver_and_name(request: &Request, env: &TaskEnv, zip_file_name: String) -> Result<()> {
    let common = request.common();
    let ckan_host = host(request);
    let doi = match request {
        Request::Datastore(d) => d.doi.clone(),
        Request::Dwc(d) => d.datastore.doi.clone(),
        Request::Url(_) => None,
    };

    let mut placeholders: HashMap<&str, String> = HashMap::new();
    placeholders.insert("resource_id", common.resource_id.clone());
    placeholders.insert("zip_file_name", zip_file_name);
    placeholders.insert("ckan_host", ckan_host);
    placeholders.insert("doi", doi.clone().unwrap_or_default());

    let mut doi_body = String::new();
    let mut doi_body_html = String::new();
    if let Some(doi) = &doi {
        let mut doi_placeholders = placeholders.clone();
        doi_placeholders.insert("doi", doi.clone());
        doi_body = render(&env.config.doi_body, &doi_placeholders);
        doi_body_html = render(&env.config.doi_body_html, &doi_placeholders);
    }
    placeholders.insert("doi_body", doi_body);
    placeholders.insert("doi_body_html", doi_body_html);

    let subject = render(&env.config.email_subject, &placeholders);
    let text_body = render(&env.config.email_body, &placeholders);
    let html_body = render(&env.config.email_body_html, &placeholders);

    let smtp = SmtpConfig {
        host: env.config.smtp_host.clone(),
        port: env.config.smtp_port,
        login: env.config.smtp_login.clone(),
        password: env.config.smtp_password.clone(),
    };
    let from = env.config.email_from.clone();
    let to = common.email.clone();
    tokio::task::spawn_blocking(move || email::send(&smtp, &from, &to, &subject, text_body, html_body))
        .await
        .context("email delivery task panicked")??;
    Ok(())
}

/// Substitute `{placeholder}` tokens in `template` from `values`. Unknown
/// placeholders are left untouched.
fn render(template: &str, values: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let key = &template[i + 1..i + end];
                if let Some(value) = values.get(key) {
                    out.push_str(value);
                    i += end + 1;
                    continue;
                }
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_known_placeholders() {
        let mut values = HashMap::new();
        values.insert("name", "r1".to_owned());
        assert_eq!(render("hello {name}!", &values), "hello r1!");
    }

    #[test]
    fn render_leaves_unknown_placeholders() {
        let values = HashMap::new();
        assert_eq!(render("hello {name}!", &values), "hello {name}!");
    }
}

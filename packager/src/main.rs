#![deny(unsafe_code)]

//! `packager`: a small command-line client for operators talking to a
//! running `packagerd` instance over HTTP.

use clap::{Parser, Subcommand};
use packager_common::prelude::*;
use prettytable::{row, Table};

#[derive(Debug, Parser)]
#[command(about = "Command-line client for the resource packaging service.")]
struct Opt {
    /// Base URL of the running `packagerd` instance.
    #[arg(long, env = "PACKAGERD_URL", default_value = "http://localhost:8080")]
    url: String,

    /// Shared secret configured on the server.
    #[arg(long, env = "PACKAGER_SECRET")]
    secret: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Report the number of jobs processed so far.
    Status,

    /// Delete every cached archive on the server.
    ClearCaches,

    /// Show request/error totals, optionally restricted to one resource.
    Stats {
        #[arg(long)]
        resource_id: Option<String>,
    },

    /// List recent requests.
    Requests {
        #[arg(long, default_value = "0")]
        offset: u64,
        #[arg(long, default_value = "20")]
        limit: u64,
        #[arg(long)]
        resource_id: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },

    /// List recent errors.
    Errors {
        #[arg(long, default_value = "0")]
        offset: u64,
        #[arg(long, default_value = "20")]
        limit: u64,
        #[arg(long)]
        resource_id: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    packager_common::tracing_support::init_tracing()?;
    let opt = Opt::parse();
    debug!("args: {:?}", opt);

    let client = reqwest::Client::new();
    match opt.cmd {
        Cmd::Status => {
            let body = post(&client, &opt.url, "/status", &[("secret", opt.secret.as_str())]).await?;
            println!("worker_count: {}", body["worker_count"]);
        }
        Cmd::ClearCaches => {
            let body = post(
                &client,
                &opt.url,
                "/clear_caches",
                &[("secret", opt.secret.as_str())],
            )
            .await?;
            println!("removed: {}", body["removed"]);
        }
        Cmd::Stats { resource_id } => {
            let mut form = vec![("secret", opt.secret.as_str())];
            if let Some(r) = resource_id.as_deref() {
                form.push(("resource_id", r));
            }
            let body = post(&client, &opt.url, "/statistics", &form).await?;
            print_totals(&body);
        }
        Cmd::Requests {
            offset,
            limit,
            resource_id,
            email,
        } => {
            let offset_s = offset.to_string();
            let limit_s = limit.to_string();
            let mut form = vec![
                ("secret", opt.secret.as_str()),
                ("offset", offset_s.as_str()),
                ("limit", limit_s.as_str()),
            ];
            if let Some(r) = resource_id.as_deref() {
                form.push(("resource_id", r));
            }
            if let Some(e) = email.as_deref() {
                form.push(("email", e));
            }
            let body = post(&client, &opt.url, "/statistics/requests", &form).await?;
            print_requests(&body);
        }
        Cmd::Errors {
            offset,
            limit,
            resource_id,
            email,
        } => {
            let offset_s = offset.to_string();
            let limit_s = limit.to_string();
            let mut form = vec![
                ("secret", opt.secret.as_str()),
                ("offset", offset_s.as_str()),
                ("limit", limit_s.as_str()),
            ];
            if let Some(r) = resource_id.as_deref() {
                form.push(("resource_id", r));
            }
            if let Some(e) = email.as_deref() {
                form.push(("email", e));
            }
            let body = post(&client, &opt.url, "/statistics/errors", &form).await?;
            print_errors(&body);
        }
    }

    Ok(())
}

async fn post(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    form: &[(&str, &str)],
) -> Result<serde_json::Value> {
    let response = client
        .post(format!("{base_url}{path}"))
        .form(form)
        .send()
        .await
        .with_context(|| format!("could not reach {base_url}{path}"))?;
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("could not parse server response")?;
    if !status.is_success() {
        return Err(format_err!(
            "{}: {}",
            body["error"].as_str().unwrap_or("error"),
            body["message"].as_str().unwrap_or("request failed")
        ));
    }
    Ok(body)
}

fn print_totals(body: &serde_json::Value) {
    let mut table = Table::new();
    table.add_row(row!["resource", "requests", "errors", "emails"]);
    if let Some(map) = body.as_object() {
        for (resource, totals) in map {
            if resource == "status" {
                continue;
            }
            table.add_row(row![
                resource,
                totals["requests"],
                totals["errors"],
                totals["emails"]
            ]);
        }
    }
    table.printstd();
}

fn print_requests(body: &serde_json::Value) {
    let mut table = Table::new();
    table.add_row(row!["timestamp", "resource_id", "email", "domain", "count"]);
    if let Some(rows) = body["requests"].as_array() {
        for r in rows {
            table.add_row(row![
                r["timestamp"],
                r["resource_id"],
                r["email"],
                r["domain"],
                r["count"]
            ]);
        }
    }
    table.printstd();
}

fn print_errors(body: &serde_json::Value) {
    let mut table = Table::new();
    table.add_row(row!["timestamp", "resource_id", "email", "message"]);
    if let Some(rows) = body["errors"].as_array() {
        for r in rows {
            table.add_row(row![r["timestamp"], r["resource_id"], r["email"], r["message"]]);
        }
    }
    table.printstd();
}

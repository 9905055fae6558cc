#![deny(unsafe_code)]

//! `packagerd`: the ingress HTTP façade in front of the packaging
//! pipeline engine (`packager_common`). Thin by design — see spec §1's
//! "out of scope" list — it only parses forms, checks the shared
//! secret, and hands validated requests to the worker pools.

mod forms;
mod util;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Form, State},
    routing::post,
    Router,
};
use packager_common::dwc::Registry;
use packager_common::prelude::*;
use packager_common::request::Request;
use packager_common::stats::StatsStore;
use packager_common::task::{self, Speed, TaskEnv};
use packager_common::tracing_support::init_tracing;
use packager_common::upstream;
use packager_common::{config::Config, pool::WorkerPool};

use crate::forms::{datastore_request, dwc_request, parse_u64, url_request, RawForm, StatsForm};
use crate::util::{check_secret, success, AppState, IngressResult};

async fn status(State(state): State<AppState>, Form(form): Form<RawForm>) -> IngressResult<impl axum::response::IntoResponse> {
    check_secret(&state, form.secret.as_deref())?;
    Ok(success(serde_json::json!({
        "worker_count": state.fast_pool.processed() + state.slow_pool.processed(),
    })))
}

async fn clear_caches(
    State(state): State<AppState>,
    Form(form): Form<RawForm>,
) -> IngressResult<impl axum::response::IntoResponse> {
    check_secret(&state, form.secret.as_deref())?;
    let store = state.env.config.store_directory.clone();
    let removed = tokio::task::spawn_blocking(move || clear_zip_files(&store))
        .await
        .map_err(|e| format_err!("cache clear task panicked: {e}"))??;
    Ok(success(serde_json::json!({ "removed": removed })))
}

fn clear_zip_files(dir: &std::path::Path) -> Result<usize> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).context("could not read store directory"),
    };
    for entry in entries {
        let entry = entry.context("could not read store directory entry")?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("zip") {
            std::fs::remove_file(&path)
                .with_context(|| format!("could not remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

async fn statistics(
    State(state): State<AppState>,
    Form(form): Form<StatsForm>,
) -> IngressResult<impl axum::response::IntoResponse> {
    check_secret(&state, form.secret.as_deref())?;
    let totals = state.stats.get_totals(form.resource_id.as_deref())?;
    Ok(success(serde_json::to_value(totals).unwrap_or_default()))
}

async fn statistics_requests(
    State(state): State<AppState>,
    Form(form): Form<StatsForm>,
) -> IngressResult<impl axum::response::IntoResponse> {
    check_secret(&state, form.secret.as_deref())?;
    let offset = parse_u64(&form.offset, "offset")?.unwrap_or(0) as i64;
    let limit = parse_u64(&form.limit, "limit")?.unwrap_or(100) as i64;
    let email_filter = filter_email(&state, &form.email)?;
    let rows = state.stats.get_requests(
        offset,
        limit,
        form.resource_id.as_deref(),
        email_filter.as_deref(),
    )?;
    Ok(success(serde_json::json!({ "requests": rows })))
}

async fn statistics_errors(
    State(state): State<AppState>,
    Form(form): Form<StatsForm>,
) -> IngressResult<impl axum::response::IntoResponse> {
    check_secret(&state, form.secret.as_deref())?;
    let offset = parse_u64(&form.offset, "offset")?.unwrap_or(0) as i64;
    let limit = parse_u64(&form.limit, "limit")?.unwrap_or(100) as i64;
    let email_filter = filter_email(&state, &form.email)?;
    let rows = state.stats.get_errors(
        offset,
        limit,
        form.resource_id.as_deref(),
        email_filter.as_deref(),
    )?;
    Ok(success(serde_json::json!({ "errors": rows })))
}

fn filter_email(state: &AppState, email: &Option<String>) -> IngressResult<Option<String>> {
    match email {
        None => Ok(None),
        Some(e) => Ok(Some(state.stats.filter_email(e)?)),
    }
}

async fn package_datastore(
    State(state): State<AppState>,
    Form(form): Form<RawForm>,
) -> IngressResult<impl axum::response::IntoResponse> {
    check_secret(&state, form.secret.as_deref())?;
    let req = Request::Datastore(datastore_request(&form)?);
    enqueue(&state, req).await
}

async fn package_url(
    State(state): State<AppState>,
    Form(form): Form<RawForm>,
) -> IngressResult<impl axum::response::IntoResponse> {
    check_secret(&state, form.secret.as_deref())?;
    let req = Request::Url(url_request(&form)?);
    enqueue(&state, req).await
}

async fn package_dwc_archive(
    State(state): State<AppState>,
    Form(form): Form<RawForm>,
) -> IngressResult<impl axum::response::IntoResponse> {
    check_secret(&state, form.secret.as_deref())?;
    let req = Request::Dwc(dwc_request(&form)?);
    enqueue(&state, req).await
}

async fn enqueue(state: &AppState, req: Request) -> IngressResult<impl axum::response::IntoResponse> {
    req.validate()
        .map_err(|e| packager_common::error::PackageError::BadRequest(e.to_string()))?;
    let pool = match task::speed(&req, &state.env.config)? {
        Speed::Fast => &state.fast_pool,
        Speed::Slow => &state.slow_pool,
    };
    let env = state.env.clone();
    pool.submit(Box::pin(async move { task::run(req, env).await }))?;
    Ok(success(serde_json::json!({ "message": "job queued" })))
}

async fn initialize(config: Arc<Config>, secret: String) -> Result<AppState> {
    std::fs::create_dir_all(&config.store_directory)
        .with_context(|| format!("could not create {}", config.store_directory.display()))?;
    std::fs::create_dir_all(&config.temp_directory)
        .with_context(|| format!("could not create {}", config.temp_directory.display()))?;

    let stats = Arc::new(StatsStore::open(&config.stats_db, config.is_anonymized())?);
    let registry = if config.dwc_core_extension.as_os_str().is_empty() {
        None
    } else {
        Some(Arc::new(Registry::load(
            &config.dwc_core_extension,
            &config.dwc_additional_extensions,
        )?))
    };

    let env = TaskEnv {
        config: config.clone(),
        stats: stats.clone(),
        registry,
        http: upstream::default_client()?,
    };

    Ok(AppState {
        secret: Arc::new(secret),
        stats,
        fast_pool: Arc::new(WorkerPool::start(config.workers, config.requests_per_worker)),
        slow_pool: Arc::new(WorkerPool::start(
            config.workers.max(1),
            config.requests_per_worker,
        )),
        env,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = Arc::new(Config::from_env().context("could not load configuration")?);
    let (host, port, secret) =
        Config::ingress_settings().context("could not load ingress settings")?;
    let state = initialize(config, secret).await?;

    let app = Router::new()
        .route("/", post(status))
        .route("/status", post(status))
        .route("/clear_caches", post(clear_caches))
        .route("/statistics", post(statistics))
        .route("/statistics/requests", post(statistics_requests))
        .route("/statistics/errors", post(statistics_errors))
        .route("/package_datastore", post(package_datastore))
        .route("/package_dwc_archive", post(package_dwc_archive))
        .route("/package_url", post(package_url))
        .with_state(state.clone());

    let addr = format!("{host}:{port}");
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;

    let shutdown_state = state;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_state
                .fast_pool
                .terminate(Duration::from_secs(30))
                .await;
            shutdown_state
                .slow_pool
                .terminate(Duration::from_secs(30))
                .await;
        })
        .await
        .context("server error")?;

    Ok(())
}

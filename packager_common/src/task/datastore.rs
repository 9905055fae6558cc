//! The datastore variant: paginate the upstream search endpoint straight
//! into a CSV (optionally converted to xlsx).

use serde_json::{Map, Value};

use super::TaskEnv;
use crate::error::PackageError;
use crate::prelude::*;
use crate::request::{DatastoreRequest, Format};
use crate::upstream::UpstreamReader;
use crate::workspace::Workspace;

/// Name of the single data file a datastore export produces, before the
/// format-appropriate extension is appended.
const BASE_NAME: &str = "resource";

#[instrument(skip_all, level = "debug", fields(resource_id = %req.common.resource_id))]
pub async fn create_zip(
    req: &DatastoreRequest,
    workspace: &mut Workspace,
    env: &TaskEnv,
    fingerprint: &str,
) -> Result<PathBuf> {
    let reader = build_reader(req, env);
    let (fields, backend) = reader.get_fields_and_backend().await?;
    if fields.is_empty() {
        return Err(
            PackageError::UpstreamTransport("upstream returned no fields".to_owned()).into(),
        );
    }
    let field_ids: Vec<String> = fields
        .iter()
        .filter_map(|f| f.get("id").and_then(Value::as_str).map(str::to_owned))
        .collect();

    let file_name = format!("{BASE_NAME}.{}", req.format.working_extension());
    {
        let writer = workspace.get_csv_writer(&file_name, req.format.delimiter())?;
        writer
            .write_record(&field_ids)
            .context("could not write header row")?;

        reader
            .for_each_record(backend, |record| {
                let row: Vec<String> = field_ids
                    .iter()
                    .map(|id| render_cell(record.get(id)))
                    .collect();
                writer.write_record(&row).context("could not write data row")
            })
            .await?;
        writer.flush().context("could not flush resource writer")?;
    }

    if req.format == Format::Xlsx {
        finalize_xlsx(workspace, &file_name).await?;
    }

    workspace
        .create_zip(&env.config.store_directory, fingerprint, &env.config.zip_command)
        .await
}

pub(super) fn build_reader(req: &DatastoreRequest, env: &TaskEnv) -> UpstreamReader {
    let mut params = Map::new();
    if let Some(filters) = &req.filters {
        params.insert("filters".to_owned(), filters.clone());
    }
    if let Some(q) = &req.q {
        params.insert("q".to_owned(), Value::from(q.clone()));
    }
    if let Some(plain) = req.plain {
        params.insert("plain".to_owned(), Value::from(plain));
    }
    if let Some(language) = &req.language {
        params.insert("language".to_owned(), Value::from(language.clone()));
    }
    if let Some(fields) = &req.fields {
        params.insert("fields".to_owned(), Value::from(fields.clone()));
    }
    if let Some(sort) = &req.sort {
        params.insert("sort".to_owned(), Value::from(sort.clone()));
    }

    UpstreamReader::new(
        env.http.clone(),
        req.api_url.clone(),
        req.key.clone(),
        params,
        env.config.page_size,
        req.offset.unwrap_or(0),
        req.limit,
    )
}

fn render_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Stream the CSV back out into a write-only spreadsheet and drop the
/// intermediate file, so the whole conversion never holds more than one
/// row in memory at a time.
async fn finalize_xlsx(workspace: &mut Workspace, csv_name: &str) -> Result<()> {
    let csv_path = workspace.path().join(csv_name);
    let xlsx_name = format!(
        "{}.xlsx",
        csv_name.strip_suffix(".csv").unwrap_or(csv_name)
    );
    let xlsx_path = workspace.path().join(&xlsx_name);

    tokio::task::spawn_blocking({
        let csv_path = csv_path.clone();
        let xlsx_path = xlsx_path.clone();
        move || convert_csv_to_xlsx(&csv_path, &xlsx_path)
    })
    .await
    .context("xlsx conversion task panicked")??;

    std::fs::remove_file(&csv_path).context("could not remove intermediate csv")?;
    workspace.forget_writer(csv_name);
    workspace.register_external_file(&xlsx_name);
    Ok(())
}

fn convert_csv_to_xlsx(csv_path: &Path, xlsx_path: &Path) -> Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(csv_path)
        .context("could not reopen csv for xlsx conversion")?;

    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook
        .add_worksheet()
        .set_name("data")
        .context("could not name worksheet")?;

    for (row_index, record) in reader.records().enumerate() {
        let record = record.context("could not read csv row during xlsx conversion")?;
        for (col_index, value) in record.iter().enumerate() {
            sheet
                .write_string(row_index as u32, col_index as u16, value)
                .context("could not write xlsx cell")?;
        }
    }

    workbook
        .save(xlsx_path)
        .context("could not save xlsx workbook")?;
    Ok(())
}

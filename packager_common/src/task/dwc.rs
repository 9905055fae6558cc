//! The Darwin Core Archive variant: routes upstream fields into one or
//! more extension CSVs via the DwC mapping registry and archive layout,
//! then writes a GBIF-style `meta.xml` (and optional `eml.xml`).

use std::fs::File;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer as XmlWriter;
use serde_json::{Map, Value};

use super::{datastore, TaskEnv};
use crate::dwc::archive::{ArchiveLayout, FieldContribution};
use crate::dwc::Registry;
use crate::error::PackageError;
use crate::prelude::*;
use crate::request::DwcRequest;
use crate::workspace::Workspace;

const DWC_TEXT_NS: &str = "http://rs.tdwg.org/dwc/text/";

#[instrument(skip_all, level = "debug", fields(resource_id = %req.datastore.common.resource_id))]
pub async fn create_zip(
    req: &DwcRequest,
    workspace: &mut Workspace,
    env: &TaskEnv,
    fingerprint: &str,
) -> Result<PathBuf> {
    let registry = env
        .registry
        .clone()
        .ok_or_else(|| PackageError::Internal("DwC registry not configured".to_owned()))?;

    let reader = datastore::build_reader(&req.datastore, env);
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

    let layout = route_fields(&field_ids, &registry, env);
    let dir = workspace.path().to_owned();

    let mut writers: HashMap<String, csv::Writer<File>> = HashMap::new();
    for extension in layout.extensions() {
        let file_name = ArchiveLayout::file_name(extension);
        let path = dir.join(&file_name);
        let file = File::create(&path)
            .with_context(|| format!("could not create {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b',')
            .quote(b'"')
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);

        let mut header = vec![env.config.dwc_id_field.clone()];
        header.extend(layout.terms(extension).iter().cloned());
        writer
            .write_record(&header)
            .with_context(|| format!("could not write header for {extension}"))?;
        writers.insert(extension.clone(), writer);
    }

    reader
        .for_each_record(backend, |record| {
            write_record(
                &record,
                &layout,
                &env.config.dwc_id_field,
                &env.config.dwc_dynamic_term,
                &mut writers,
            )
        })
        .await?;

    for (extension, writer) in writers.iter_mut() {
        writer
            .flush()
            .with_context(|| format!("could not flush {extension}"))?;
    }
    drop(writers);

    for extension in layout.extensions() {
        workspace.register_external_file(&ArchiveLayout::file_name(extension));
    }

    write_meta_xml(workspace, &layout, &registry)?;
    if let Some(eml) = &req.eml {
        write_eml_xml(workspace, eml)?;
    }

    workspace
        .create_zip(&env.config.store_directory, fingerprint, &env.config.zip_command)
        .await
}

/// Fold a space-separated field name the way a DwC term name is
/// conventionally cased: the leading word lowercased (unless it's
/// all-caps), subsequent words capitalised (unless all-caps), rejoined
/// with no separator. Only spaces are treated as word breaks; an
/// underscore is just another character in the word.
fn camel_fold(name: &str) -> String {
    let mut words = name.split(' ').filter(|w| !w.is_empty());
    let mut out = String::new();
    if let Some(first) = words.next() {
        out.push_str(&fold_word(first, true));
    }
    for word in words {
        out.push_str(&fold_word(word, false));
    }
    out
}

fn fold_word(word: &str, leading: bool) -> String {
    if word.chars().all(|c| !c.is_alphabetic() || c.is_uppercase()) {
        return word.to_owned();
    }
    let mut chars = word.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => {
            let rest: String = chars.collect();
            if leading {
                format!("{}{}", first.to_lowercase(), rest)
            } else {
                format!("{}{}", first.to_uppercase(), rest)
            }
        }
    }
}

fn route_fields(field_ids: &[String], registry: &Registry, env: &TaskEnv) -> ArchiveLayout {
    let mut layout = ArchiveLayout::new();
    let core = registry
        .extensions()
        .first()
        .map(|s| s.to_string())
        .unwrap_or_default();

    for field in field_ids {
        if *field == env.config.dwc_id_field {
            continue;
        }

        if registry.term_exists(field) {
            let extension = registry.term_extension(field).unwrap_or(&core).to_owned();
            layout.add_term(field, None, &extension, field, None, None);
            continue;
        }

        let folded = camel_fold(field);
        if registry.term_exists(&folded) {
            let extension = registry
                .term_extension(&folded)
                .unwrap_or(&core)
                .to_owned();
            layout.add_term(field, None, &extension, &folded, None, None);
            continue;
        }

        if let Some(ext_field) = env
            .config
            .dwc_extension_fields
            .iter()
            .find(|e| &e.input_field == field)
        {
            for (sub_field, sub_cfg) in &ext_field.sub_fields {
                layout.add_term(
                    field,
                    Some(sub_field),
                    &ext_field.extension,
                    &sub_cfg.term,
                    sub_cfg.formatter.as_deref(),
                    sub_cfg.default.as_deref(),
                );
            }
            continue;
        }

        layout.add_term(field, None, &core, &env.config.dwc_dynamic_term, None, None);
    }
    layout
}

fn write_record(
    record: &Value,
    layout: &ArchiveLayout,
    id_field: &str,
    dynamic_term: &str,
    writers: &mut HashMap<String, csv::Writer<File>>,
) -> Result<()> {
    let id_value = render_scalar(record.get(id_field));

    for extension in layout.extensions() {
        let terms = layout.terms(extension);
        let rows = row_count(extension, terms, layout, record);

        for row_index in 0..rows.max(1) {
            let mut row = vec![id_value.clone()];
            for term in terms {
                let contributions = layout.term_fields(extension, term);
                let lower_case_keys = term == dynamic_term;
                row.push(render_term(record, contributions, row_index, lower_case_keys));
            }
            let writer = writers
                .get_mut(extension)
                .ok_or_else(|| format_err!("no writer opened for extension {extension}"))?;
            writer
                .write_record(&row)
                .with_context(|| format!("could not write row for {extension}"))?;
        }
    }
    Ok(())
}

fn row_count(extension: &str, terms: &[String], layout: &ArchiveLayout, record: &Value) -> usize {
    let mut max = 1usize;
    for term in terms {
        for contribution in layout.term_fields(extension, term) {
            if contribution.sub_field.is_some() {
                if let Some(Value::Array(items)) = record.get(&contribution.input_field) {
                    max = max.max(items.len());
                }
            }
        }
    }
    max
}

/// Render one (extension, term) cell. The dynamic-properties catch-all
/// term always holds a JSON object, even with a single contributing
/// field, since its whole point is to carry arbitrary key/value JSON; any
/// other term is written as a plain scalar with one contributor and
/// combined into a JSON object only once several fields share it. Keys
/// are lower-cased for the dynamic-properties bucket and camelCased for
/// every other combined term.
fn render_term(
    record: &Value,
    contributions: &[FieldContribution],
    row_index: usize,
    lower_case_keys: bool,
) -> String {
    match contributions {
        [] => String::new(),
        [single] if !lower_case_keys => render_contribution(record, single, row_index),
        many => {
            let mut obj = Map::new();
            for c in many {
                let rendered = render_contribution(record, c, row_index);
                if rendered.is_empty() {
                    continue;
                }
                let key = if lower_case_keys {
                    c.input_field.to_lowercase()
                } else {
                    camel_fold(&c.input_field)
                };
                let value = serde_json::from_str::<Value>(&rendered)
                    .unwrap_or_else(|_| Value::String(rendered));
                obj.insert(key, value);
            }
            Value::Object(obj).to_string()
        }
    }
}

fn render_contribution(record: &Value, c: &FieldContribution, row_index: usize) -> String {
    let raw = record.get(&c.input_field);
    let value = match (&c.sub_field, raw) {
        (Some(sub_field), Some(Value::Array(items))) => {
            let item = items.get(row_index).or_else(|| items.last());
            item.and_then(|v| v.get(sub_field)).cloned()
        }
        (Some(sub_field), Some(Value::Object(_))) => raw.and_then(|v| v.get(sub_field)).cloned(),
        (None, _) => raw.cloned(),
        _ => None,
    };
    // A missing sub-field key (not present at all, as opposed to present
    // with a null value) falls back to the configured extension-field
    // default, mirroring how the defaults dict is merged under the
    // decoded item's own keys in the source system.
    let value = match (&c.sub_field, &value) {
        (Some(_), None) => c.default.clone().map(Value::String).or(value),
        _ => value,
    };
    apply_formatter(c.formatter.as_deref(), value.as_ref())
}

fn apply_formatter(formatter: Option<&str>, value: Option<&Value>) -> String {
    let rendered = render_scalar(value);
    match formatter {
        Some("upper") => rendered.to_uppercase(),
        Some("lower") => rendered.to_lowercase(),
        _ => rendered,
    }
}

fn render_scalar(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn write_meta_xml(workspace: &mut Workspace, layout: &ArchiveLayout, registry: &Registry) -> Result<()> {
    let path = workspace.path().join("meta.xml");
    let file = File::create(&path).context("could not create meta.xml")?;
    let mut writer = XmlWriter::new_with_indent(file, b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("could not write xml declaration")?;

    let mut archive = BytesStart::new("archive");
    archive.push_attribute(("xmlns", DWC_TEXT_NS));
    if workspace.path().join("eml.xml").exists() {
        archive.push_attribute(("metadata", "eml.xml"));
    }
    writer
        .write_event(Event::Start(archive))
        .context("could not write <archive>")?;

    let extensions = layout.extensions();
    if let Some(core) = extensions.first() {
        write_extension_block(&mut writer, layout, registry, core, true)?;
    }
    for extension in extensions.iter().skip(1) {
        write_extension_block(&mut writer, layout, registry, extension, false)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("archive")))
        .context("could not write </archive>")?;
    workspace.register_external_file("meta.xml");
    Ok(())
}

fn write_extension_block(
    writer: &mut XmlWriter<File>,
    layout: &ArchiveLayout,
    registry: &Registry,
    extension: &str,
    is_core: bool,
) -> Result<()> {
    let tag = if is_core { "core" } else { "extension" };
    let row_type = registry.row_type(extension).unwrap_or_default();

    let mut start = BytesStart::new(tag);
    start.push_attribute(("encoding", "UTF-8"));
    start.push_attribute(("linesTerminatedBy", "\\n"));
    start.push_attribute(("fieldsTerminatedBy", ","));
    start.push_attribute(("fieldsEnclosedBy", "\""));
    start.push_attribute(("ignoreHeaderLines", "1"));
    start.push_attribute(("rowType", row_type));
    writer
        .write_event(Event::Start(start))
        .context("could not write extension block")?;

    writer
        .write_event(Event::Start(BytesStart::new("files")))
        .context("could not write <files>")?;
    writer
        .write_event(Event::Start(BytesStart::new("location")))
        .context("could not write <location>")?;
    writer
        .write_event(Event::Text(BytesText::new(&ArchiveLayout::file_name(
            extension,
        ))))
        .context("could not write file location text")?;
    writer
        .write_event(Event::End(BytesEnd::new("location")))
        .context("could not close <location>")?;
    writer
        .write_event(Event::End(BytesEnd::new("files")))
        .context("could not close <files>")?;

    let id_tag = if is_core { "id" } else { "coreid" };
    let mut id_elem = BytesStart::new(id_tag);
    id_elem.push_attribute(("index", "0"));
    writer
        .write_event(Event::Empty(id_elem))
        .with_context(|| format!("could not write <{id_tag}>"))?;

    for (i, term) in layout.terms(extension).iter().enumerate() {
        let qualified = registry.term_qualified(term).unwrap_or(term).to_owned();
        let mut field = BytesStart::new("field");
        field.push_attribute(("index", (i + 1).to_string().as_str()));
        field.push_attribute(("term", qualified.as_str()));
        writer
            .write_event(Event::Empty(field))
            .context("could not write <field>")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .context("could not close extension block")?;
    Ok(())
}

fn write_eml_xml(workspace: &mut Workspace, template: &str) -> Result<()> {
    let package_id = Uuid::new_v4();
    let now = crate::chrono::Utc::now();
    let pub_date = now.format("%Y-%m-%d").to_string();
    let date_stamp = now.format("%Y-%m-%dT%H:%M:%S+0000").to_string();

    let rendered = template
        .replace("{package_id}", &package_id.to_string())
        .replace("{pub_date}", &pub_date)
        .replace("{date_stamp}", &date_stamp);

    let path = workspace.path().join("eml.xml");
    std::fs::write(&path, rendered).context("could not write eml.xml")?;
    workspace.register_external_file("eml.xml");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_fold_lowercases_leading_word() {
        assert_eq!(camel_fold("Event date"), "eventDate");
        assert_eq!(camel_fold("basisOfRecord"), "basisOfRecord");
    }

    #[test]
    fn camel_fold_preserves_all_caps_words() {
        assert_eq!(camel_fold("DOI number"), "DOINumber");
    }

    #[test]
    fn render_term_combines_multiple_contributions_into_json() {
        let record = serde_json::json!({"remarks_en": "hello", "remarks_fr": "bonjour"});
        let contributions = vec![
            FieldContribution {
                input_field: "remarks_en".to_owned(),
                sub_field: None,
                formatter: None,
                default: None,
            },
            FieldContribution {
                input_field: "remarks_fr".to_owned(),
                sub_field: None,
                formatter: None,
                default: None,
            },
        ];
        let rendered = render_term(&record, &contributions, 0, false);
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["remarks_en"], "hello");
        assert_eq!(parsed["remarks_fr"], "bonjour");
    }

    #[test]
    fn render_term_lower_cases_keys_for_dynamic_properties() {
        let record = serde_json::json!({"Habitat": "forest", "Depth_M": "12"});
        let contributions = vec![
            FieldContribution {
                input_field: "Habitat".to_owned(),
                sub_field: None,
                formatter: None,
                default: None,
            },
            FieldContribution {
                input_field: "Depth_M".to_owned(),
                sub_field: None,
                formatter: None,
                default: None,
            },
        ];
        let rendered = render_term(&record, &contributions, 0, true);
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["habitat"], "forest");
        assert_eq!(parsed["depth_m"], "12");
    }

    #[test]
    fn render_term_wraps_a_single_dynamic_contributor_in_json() {
        let record = serde_json::json!({"unknownField": "some-value"});
        let contributions = vec![FieldContribution {
            input_field: "unknownField".to_owned(),
            sub_field: None,
            formatter: None,
            default: None,
        }];
        let rendered = render_term(&record, &contributions, 0, true);
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, serde_json::json!({"unknownfield": "some-value"}));
    }

    #[test]
    fn render_term_with_single_contribution_is_scalar() {
        let record = serde_json::json!({"basisOfRecord": "PreservedSpecimen"});
        let contributions = vec![FieldContribution {
            input_field: "basisOfRecord".to_owned(),
            sub_field: None,
            formatter: None,
            default: None,
        }];
        assert_eq!(
            render_term(&record, &contributions, 0, false),
            "PreservedSpecimen"
        );
    }

    #[test]
    fn render_contribution_falls_back_to_configured_default_when_key_is_absent() {
        let record = serde_json::json!({"associatedMedia": [{"type": "StillImage"}, {}]});
        let with_type = FieldContribution {
            input_field: "associatedMedia".to_owned(),
            sub_field: Some("type".to_owned()),
            formatter: None,
            default: Some("assocmed default type".to_owned()),
        };
        let with_format = FieldContribution {
            input_field: "associatedMedia".to_owned(),
            sub_field: Some("format".to_owned()),
            formatter: None,
            default: Some("assocmed default format".to_owned()),
        };
        assert_eq!(render_contribution(&record, &with_type, 0), "StillImage");
        assert_eq!(
            render_contribution(&record, &with_type, 1),
            "assocmed default type"
        );
        assert_eq!(
            render_contribution(&record, &with_format, 1),
            "assocmed default format"
        );
    }

    #[test]
    fn row_count_follows_longest_extension_field_array() {
        let mut layout = ArchiveLayout::new();
        layout.add_term(
            "measurements",
            Some("value"),
            "MeasurementOrFact",
            "measurementValue",
            None,
            None,
        );
        let record = serde_json::json!({
            "measurements": [{"value": "1"}, {"value": "2"}, {"value": "3"}]
        });
        let terms = layout.terms("MeasurementOrFact").to_vec();
        assert_eq!(row_count("MeasurementOrFact", &terms, &layout, &record), 3);
    }
}

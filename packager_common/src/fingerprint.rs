//! Content-addressed cache keys derived from a request descriptor.

use crate::prelude::*;
use crate::request::Request;

/// Compute the stable cache fingerprint for a request: every field of the
/// descriptor except `email`, enumerated in sorted `key:value;` order and
/// hashed. Two requests that differ only in `email` share a fingerprint.
pub fn fingerprint(request: &Request) -> Result<String> {
    let mut value = serde_json::to_value(as_flat_map(request))
        .context("could not serialize request descriptor")?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("email");
    }
    let obj = value
        .as_object()
        .ok_or_else(|| format_err!("request descriptor did not serialize to an object"))?;

    let mut entries: Vec<(String, String)> = obj
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), canonical_value(v)))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut buf = String::new();
    for (key, val) in entries {
        buf.push_str(&key);
        buf.push(':');
        buf.push_str(&val);
        buf.push(';');
    }

    Ok(format!("{:x}", md5::compute(buf.as_bytes())))
}

fn canonical_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flatten a [`Request`] into a single JSON object combining its common
/// and variant-specific fields, mirroring the "bag of fields" the original
/// form-based schema produced.
fn as_flat_map(request: &Request) -> serde_json::Value {
    match request {
        Request::Datastore(r) => serde_json::to_value(r).expect("DatastoreRequest serializes"),
        Request::Url(r) => serde_json::to_value(r).expect("UrlRequest serializes"),
        Request::Dwc(r) => serde_json::to_value(r).expect("DwcRequest serializes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Common, DatastoreRequest, Format};

    fn base() -> DatastoreRequest {
        DatastoreRequest {
            common: Common {
                resource_id: "r1".to_owned(),
                email: "a@x.com".to_owned(),
            },
            api_url: "http://catalog.example.org/search".to_owned(),
            key: None,
            filters: None,
            q: None,
            plain: None,
            language: None,
            fields: None,
            sort: None,
            limit: Some(10),
            offset: None,
            format: Format::Csv,
            doi: None,
        }
    }

    #[test]
    fn fingerprint_ignores_email() {
        let mut a = base();
        let mut b = base();
        b.common.email = "b@x.com".to_owned();

        let fa = fingerprint(&Request::Datastore(a.clone())).unwrap();
        let fb = fingerprint(&Request::Datastore(b.clone())).unwrap();
        assert_eq!(fa, fb);

        a.limit = Some(11);
        let fa2 = fingerprint(&Request::Datastore(a)).unwrap();
        assert_ne!(fa, fa2);
        let _ = &b;
    }

    #[test]
    fn fingerprint_is_32_hex_chars() {
        let f = fingerprint(&Request::Datastore(base())).unwrap();
        assert_eq!(f.len(), 32);
        assert!(f.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

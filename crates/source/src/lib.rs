//! Source loader: resolve bundle references, decode multi-document YAML
//! payloads into object descriptors, and checksum the loaded bytes.

#![forbid(unsafe_code)]

use rudder_core::{ObjectDescriptor, SourceRef};
use rudder_store::{SourceStore, StoreError};
use sha2::{Digest, Sha256};
use tracing::debug;

fn max_bundle_bytes() -> usize {
    std::env::var("RUDDER_MAX_BUNDLE_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

/// One manifest document that failed to decode. Permanent for this cycle;
/// isolated from the documents that did decode.
#[derive(Debug, Clone)]
pub struct DecodeFailure {
    pub source: String,
    pub entry: String,
    pub doc_index: usize,
    pub message: String,
}

impl std::fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}] doc {}: {}", self.source, self.entry, self.doc_index, self.message)
    }
}

/// Everything one cycle loads from the source store.
#[derive(Debug, Default)]
pub struct LoadedBundle {
    pub objects: Vec<ObjectDescriptor>,
    pub failures: Vec<DecodeFailure>,
    /// SHA-256 over all loaded bytes, in reference order then entry order.
    pub checksum: String,
}

/// Fetch every referenced bundle and decode it. Missing bundles surface as
/// `StoreError::NotFound` (transient, caller retries with backoff); decode
/// failures are collected per document and never abort the load.
pub async fn load(
    source: &dyn SourceStore,
    namespace: &str,
    refs: &[SourceRef],
) -> Result<LoadedBundle, StoreError> {
    let mut out = LoadedBundle::default();
    let mut hasher = Sha256::new();
    let mut total = 0usize;

    for r in refs {
        let entries = source.fetch(namespace, &r.name).await?;
        for (entry_name, bytes) in &entries {
            total += bytes.len();
            if total > max_bundle_bytes() {
                return Err(StoreError::Invalid(format!(
                    "bundle payload too large (>{} bytes)",
                    max_bundle_bytes()
                )));
            }
            hasher.update(entry_name.as_bytes());
            hasher.update(bytes);
            decode_entry(&r.name, entry_name, bytes, &mut out);
        }
    }

    out.checksum = hex(&hasher.finalize());
    debug!(
        objects = out.objects.len(),
        failures = out.failures.len(),
        checksum = %out.checksum,
        "bundle loaded"
    );
    Ok(out)
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn decode_entry(source: &str, entry: &str, bytes: &[u8], out: &mut LoadedBundle) {
    let text = match std::str::from_utf8(bytes) {
        Ok(t) => t,
        Err(e) => {
            out.failures.push(DecodeFailure {
                source: source.to_string(),
                entry: entry.to_string(),
                doc_index: 0,
                message: format!("payload is not UTF-8: {e}"),
            });
            return;
        }
    };
    // Split documents by hand so one malformed document does not poison the
    // rest of the entry.
    for (idx, doc) in split_documents(text).into_iter().enumerate() {
        if doc.trim().is_empty() {
            continue;
        }
        match decode_document(&doc) {
            Ok(Some(desc)) => out.objects.push(desc),
            Ok(None) => {}
            Err(message) => out.failures.push(DecodeFailure {
                source: source.to_string(),
                entry: entry.to_string(),
                doc_index: idx,
                message,
            }),
        }
    }
}

fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line == "---" || line.starts_with("--- ") {
            docs.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    docs.push(current);
    docs
}

fn decode_document(doc: &str) -> Result<Option<ObjectDescriptor>, String> {
    let val: serde_yaml::Value =
        serde_yaml::from_str(doc).map_err(|e| format!("parsing YAML: {e}"))?;
    if val.is_null() {
        return Ok(None);
    }
    let json = serde_json::to_value(val).map_err(|e| format!("converting YAML to JSON: {e}"))?;
    let api_version = json
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or("missing apiVersion")?
        .to_string();
    let kind =
        json.get("kind").and_then(|v| v.as_str()).ok_or("missing kind")?.to_string();
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version),
    };
    let meta = json.get("metadata").ok_or("missing metadata")?;
    let name = meta
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or("missing metadata.name")?
        .to_string();
    let namespace =
        meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
    Ok(Some(ObjectDescriptor { group, version, kind, namespace, name, payload: json, field_path: None }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_store::MemSource;

    fn refs(names: &[&str]) -> Vec<SourceRef> {
        names.iter().map(|n| SourceRef { name: n.to_string() }).collect()
    }

    #[tokio::test]
    async fn decodes_multi_document_bundles_in_order() {
        let src = MemSource::new();
        src.put_single(
            "ns",
            "bundle",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: ns\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: ns\n",
        );
        let loaded = load(&src, "ns", &refs(&["bundle"])).await.unwrap();
        assert_eq!(loaded.objects.len(), 2);
        assert_eq!(loaded.objects[0].kind, "ConfigMap");
        assert_eq!(loaded.objects[1].group, "apps");
        assert_eq!(loaded.objects[1].version, "v1");
        assert!(loaded.failures.is_empty());
        assert_eq!(loaded.checksum.len(), 64);
    }

    #[tokio::test]
    async fn malformed_document_is_isolated() {
        let src = MemSource::new();
        src.put_single(
            "ns",
            "bundle",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: good\n---\nkind: NoApiVersion\nmetadata:\n  name: bad\n",
        );
        let loaded = load(&src, "ns", &refs(&["bundle"])).await.unwrap();
        assert_eq!(loaded.objects.len(), 1);
        assert_eq!(loaded.objects[0].name, "good");
        assert_eq!(loaded.failures.len(), 1);
        assert!(loaded.failures[0].message.contains("apiVersion"), "{}", loaded.failures[0]);
    }

    #[tokio::test]
    async fn missing_bundle_is_not_found() {
        let src = MemSource::new();
        let err = load(&src, "ns", &refs(&["ghost"])).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn checksum_is_stable_and_content_sensitive() {
        let src = MemSource::new();
        src.put_single("ns", "a", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n");
        src.put_single("ns", "b", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: y\n");

        let first = load(&src, "ns", &refs(&["a", "b"])).await.unwrap().checksum;
        let again = load(&src, "ns", &refs(&["a", "b"])).await.unwrap().checksum;
        assert_eq!(first, again);

        let reordered = load(&src, "ns", &refs(&["b", "a"])).await.unwrap().checksum;
        assert_ne!(first, reordered);

        src.put_single("ns", "a", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: z\n");
        let changed = load(&src, "ns", &refs(&["a", "b"])).await.unwrap().checksum;
        assert_ne!(first, changed);
    }

    #[tokio::test]
    async fn empty_documents_and_comments_are_skipped() {
        let src = MemSource::new();
        src.put_single("ns", "bundle", "---\n# nothing here\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: s\n");
        let loaded = load(&src, "ns", &refs(&["bundle"])).await.unwrap();
        assert_eq!(loaded.objects.len(), 1);
        assert!(loaded.failures.is_empty());
    }
}

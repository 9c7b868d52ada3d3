//! Registry (C3): composes the content store and metadata store into a
//! function repository with push/pull/tag/list semantics.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::digest::{compute_full_digest, FullDigest, ShortDigest};
use crate::error::EngineError;
use crate::store::{metadata::MetadataStore, ContentStore};

/// Per-version settings supplied at push time.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionSettings {
    #[serde(default)]
    pub wasi: bool,
    #[serde(default)]
    pub allowed_urls: Vec<String>,
}

/// One immutable record of a digest for a function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Version {
    pub short_digest: ShortDigest,
    pub full_digest: FullDigest,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub tags: Vec<String>,
}

/// Durable per-(namespace,name) record: ordered, append-only version list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub namespace: String,
    pub name: String,
    pub versions: Vec<Version>,
    pub settings: VersionSettings,
}

impl FunctionMetadata {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            versions: Vec::new(),
            settings: VersionSettings::default(),
        }
    }

    fn find_by_short(&self, short: &ShortDigest) -> Option<&Version> {
        self.versions.iter().find(|v| &v.short_digest == short)
    }

    fn find_by_full(&self, full: &FullDigest) -> Option<&Version> {
        self.versions.iter().find(|v| &v.full_digest == full)
    }

    fn find_by_tag(&self, tag: &str) -> Option<&Version> {
        self.versions.iter().find(|v| v.tags.iter().any(|t| t == tag))
    }

    /// Remove `tag` from every version's tag set.
    fn strip_tag(&mut self, tag: &str) {
        for version in &mut self.versions {
            version.tags.retain(|t| t != tag);
        }
    }
}

/// How a pull reference was resolved, or what a build/load operation did.
#[derive(Clone, Debug)]
pub struct ResolvedVersion {
    pub short_digest: ShortDigest,
    pub full_digest: FullDigest,
    pub size: u64,
    pub tags: Vec<String>,
}

impl From<&Version> for ResolvedVersion {
    fn from(v: &Version) -> Self {
        Self {
            short_digest: v.short_digest.clone(),
            full_digest: v.full_digest.clone(),
            size: v.size,
            tags: v.tags.clone(),
        }
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// The function registry: content-addressed storage + durable metadata.
#[derive(Clone)]
pub struct Registry {
    content: ContentStore,
    metadata: MetadataStore,
}

impl Registry {
    pub fn new(content: ContentStore, metadata: MetadataStore) -> Self {
        Self { content, metadata }
    }

    fn load_metadata(&self, namespace: &str, name: &str) -> Result<FunctionMetadata> {
        let key = key(namespace, name);
        Ok(self
            .metadata
            .get::<FunctionMetadata>(&key)?
            .unwrap_or_else(|| FunctionMetadata::new(namespace, name)))
    }

    fn save_metadata(&self, meta: &FunctionMetadata) -> Result<()> {
        self.metadata.put(&key(&meta.namespace, &meta.name), meta)
    }

    /// Verify `sha256(payload || manifest) == declared_full_digest`, store
    /// the blob, and merge `tag` into the matching version's tag set
    /// (creating a fresh version if the digest is new).
    #[tracing::instrument(level = "debug", skip(self, payload, manifest))]
    pub async fn push(
        &self,
        namespace: &str,
        name: &str,
        payload: &[u8],
        declared_full_digest: &FullDigest,
        tag: Option<&str>,
        manifest: &serde_json::Value,
        settings: VersionSettings,
    ) -> Result<ResolvedVersion, EngineError> {
        if namespace.is_empty() || name.is_empty() {
            return Err(EngineError::BadRequest(
                "namespace and name must be non-empty".into(),
            ));
        }

        let computed = compute_full_digest(payload, manifest);
        if &computed != declared_full_digest {
            return Err(EngineError::Integrity(format!(
                "declared digest {declared_full_digest} does not match computed digest {computed}"
            )));
        }
        let short = computed.short();

        let mut meta = self
            .load_metadata(namespace, name)
            .map_err(EngineError::Internal)?;

        // Guard against a 16-hex short-digest collision between two distinct
        // full digests for the same function (astronomically unlikely, but
        // deliberately testable).
        if let Some(existing) = meta.find_by_short(&short) {
            if existing.full_digest != computed {
                return Err(EngineError::Integrity(format!(
                    "short digest {short} collides with an existing version of a different full digest"
                )));
            }
        }

        if let Some(tag) = tag {
            if !tag.is_empty() {
                meta.strip_tag(tag);
            }
        }

        let resolved = if let Some(existing) = meta.find_by_short(&short).cloned() {
            let version = meta
                .versions
                .iter_mut()
                .find(|v| v.short_digest == short)
                .expect("just located by short digest above");
            if let Some(tag) = tag {
                if !tag.is_empty() && !version.tags.iter().any(|t| t == tag) {
                    version.tags.push(tag.to_string());
                }
            }
            ResolvedVersion::from(&*version)
        } else {
            self.content
                .write(namespace, name, &short, payload)
                .await
                .context("error writing blob to content store")
                .map_err(EngineError::Internal)?;

            let tags = match tag {
                Some(t) if !t.is_empty() => vec![t.to_string()],
                _ => Vec::new(),
            };
            let version = Version {
                short_digest: short.clone(),
                full_digest: computed.clone(),
                size: payload.len() as u64,
                created_at: OffsetDateTime::now_utc(),
                tags,
            };
            meta.versions.push(version.clone());
            ResolvedVersion::from(&version)
        };

        meta.settings = settings;
        self.save_metadata(&meta).map_err(EngineError::Internal)?;

        Ok(resolved)
    }

    /// Resolve `reference` (tag, full digest, or short digest) and return
    /// the blob bytes plus its resolved version.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn pull(
        &self,
        namespace: &str,
        name: &str,
        reference: &str,
    ) -> Result<(Vec<u8>, ResolvedVersion), EngineError> {
        let meta = self
            .load_metadata(namespace, name)
            .map_err(EngineError::Internal)?;

        let version = resolve_reference(&meta, reference).ok_or_else(|| {
            EngineError::NotFound(format!(
                "no version of {namespace}/{name} matches reference {reference:?}"
            ))
        })?;

        let short = version.short_digest.clone();
        let resolved = ResolvedVersion::from(version);

        let bytes = self
            .content
            .read(namespace, name, &short)
            .await
            .context("error reading blob from content store")
            .map_err(EngineError::Internal)?;

        Ok((bytes, resolved))
    }

    /// Remove `tag` from every version, then attach it to the version whose
    /// short digest is `new_short_digest`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reassign_tag(
        &self,
        namespace: &str,
        name: &str,
        tag: &str,
        new_short_digest: &ShortDigest,
    ) -> Result<(), EngineError> {
        let mut meta = self
            .load_metadata(namespace, name)
            .map_err(EngineError::Internal)?;

        meta.strip_tag(tag);

        let version = meta
            .versions
            .iter_mut()
            .find(|v| &v.short_digest == new_short_digest)
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "no version of {namespace}/{name} with short digest {new_short_digest}"
                ))
            })?;
        version.tags.push(tag.to_string());

        self.save_metadata(&meta).map_err(EngineError::Internal)?;
        Ok(())
    }

    pub fn digest_exists(&self, namespace: &str, name: &str, digest: &str) -> Result<bool> {
        let meta = self.load_metadata(namespace, name)?;
        Ok(meta
            .versions
            .iter()
            .any(|v| v.short_digest.as_str() == digest || v.full_digest.as_str() == digest))
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<Option<FunctionMetadata>> {
        let key = key(namespace, name);
        self.metadata.get::<FunctionMetadata>(&key)
    }

    pub fn list_all(&self) -> Result<Vec<FunctionMetadata>> {
        self.metadata.iterate("")
    }
}

/// Resolution order: (1) exact short-digest match, (2) exact full-digest
/// match, (3) tag lookup.
fn resolve_reference<'a>(meta: &'a FunctionMetadata, reference: &str) -> Option<&'a Version> {
    if let Ok(short) = ShortDigest::parse(reference) {
        if let Some(v) = meta.find_by_short(&short) {
            return Some(v);
        }
    }
    if let Ok(full) = FullDigest::parse(reference) {
        if let Some(v) = meta.find_by_full(&full) {
            return Some(v);
        }
    }
    meta.find_by_tag(reference)
}

/// Build a `(namespace, name[, ref])` triple from the compose-style
/// `namespace/name[:ref]` reference syntax. Missing `:ref` defaults to
/// `"latest"`.
pub fn parse_function_reference(spec: &str) -> Result<(String, String, String), EngineError> {
    let (path, reference) = match spec.split_once(':') {
        Some((path, reference)) if !reference.is_empty() => (path, reference.to_string()),
        _ => (spec, "latest".to_string()),
    };
    let (namespace, name) = path.split_once('/').ok_or_else(|| {
        EngineError::BadRequest(format!(
            "invalid function reference {spec:?}: expected namespace/name[:ref]"
        ))
    })?;
    if namespace.is_empty() || name.is_empty() {
        return Err(EngineError::BadRequest(format!(
            "invalid function reference {spec:?}: namespace and name must be non-empty"
        )));
    }
    Ok((namespace.to_string(), name.to_string(), reference))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        let content = ContentStore::new(dir.path());
        let metadata = MetadataStore::open_temporary().unwrap();
        Registry::new(content, metadata)
    }

    #[tokio::test]
    async fn push_then_pull_by_tag_roundtrips() {
        let reg = registry();
        let payload = b"wasm-bytes";
        let manifest = serde_json::json!({});
        let digest = compute_full_digest(payload, &manifest);

        let resolved = reg
            .push(
                "default",
                "hello",
                payload,
                &digest,
                Some("latest"),
                &manifest,
                VersionSettings::default(),
            )
            .await
            .unwrap();
        assert_eq!(resolved.short_digest, digest.short());
        assert_eq!(resolved.tags, vec!["latest".to_string()]);

        let (bytes, version) = reg.pull("default", "hello", "latest").await.unwrap();
        assert_eq!(bytes, payload);
        assert_eq!(version.short_digest, digest.short());
    }

    #[tokio::test]
    async fn tag_moves_to_new_digest_on_second_push() {
        let reg = registry();
        let manifest = serde_json::json!({});

        let d1 = compute_full_digest(b"v1", &manifest);
        reg.push(
            "default",
            "hello",
            b"v1",
            &d1,
            Some("latest"),
            &manifest,
            VersionSettings::default(),
        )
        .await
        .unwrap();

        let d2 = compute_full_digest(b"v2", &manifest);
        reg.push(
            "default",
            "hello",
            b"v2",
            &d2,
            Some("latest"),
            &manifest,
            VersionSettings::default(),
        )
        .await
        .unwrap();

        let (bytes, version) = reg.pull("default", "hello", "latest").await.unwrap();
        assert_eq!(bytes, b"v2");
        assert_eq!(version.short_digest, d2.short());

        let meta = reg.get("default", "hello").unwrap().unwrap();
        let v1 = meta
            .versions
            .iter()
            .find(|v| v.short_digest == d1.short())
            .unwrap();
        assert!(v1.tags.is_empty());
    }

    #[tokio::test]
    async fn reassign_tag_moves_atomically() {
        let reg = registry();
        let manifest = serde_json::json!({});

        let d1 = compute_full_digest(b"v1", &manifest);
        reg.push(
            "default",
            "hello",
            b"v1",
            &d1,
            Some("latest"),
            &manifest,
            VersionSettings::default(),
        )
        .await
        .unwrap();
        let d2 = compute_full_digest(b"v2", &manifest);
        reg.push(
            "default",
            "hello",
            b"v2",
            &d2,
            None,
            &manifest,
            VersionSettings::default(),
        )
        .await
        .unwrap();

        reg.reassign_tag("default", "hello", "latest", &d2.short())
            .unwrap();

        let (_bytes, version) = reg.pull("default", "hello", "latest").await.unwrap();
        assert_eq!(version.short_digest, d2.short());
    }

    #[tokio::test]
    async fn push_rejects_wrong_digest() {
        let reg = registry();
        let manifest = serde_json::json!({});
        let wrong = compute_full_digest(b"not-the-payload", &manifest);

        let err = reg
            .push(
                "default",
                "hello",
                b"wasm-bytes",
                &wrong,
                None,
                &manifest,
                VersionSettings::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));

        assert!(reg.get("default", "hello").unwrap().is_none());
    }

    #[tokio::test]
    async fn pull_unknown_reference_is_not_found() {
        let reg = registry();
        let err = reg.pull("default", "missing", "latest").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn parse_reference_defaults_tag_to_latest() {
        let (ns, name, reference) = parse_function_reference("default/hello").unwrap();
        assert_eq!((ns.as_str(), name.as_str(), reference.as_str()), ("default", "hello", "latest"));
    }

    #[test]
    fn parse_reference_with_tag() {
        let (ns, name, reference) = parse_function_reference("default/hello:v1.2.0").unwrap();
        assert_eq!((ns.as_str(), name.as_str(), reference.as_str()), ("default", "hello", "v1.2.0"));
    }

    #[test]
    fn parse_reference_rejects_missing_name() {
        assert!(parse_function_reference("default").is_err());
    }
}

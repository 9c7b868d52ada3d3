//! Metadata store (C2): a durable embedded KV store for per-function
//! metadata. `sled` stands in for the reference's BadgerDB — both are
//! embedded, ordered, log-structured stores with single-key atomic writes.
//!
//! Keys are `"<namespace>/<name>"`. Values are serialized `FunctionMetadata`.
//! No cross-key transactions are offered or required.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

/// A durable single-key-atomic KV store.
#[derive(Clone)]
pub struct MetadataStore {
    db: sled::Db,
}

impl MetadataStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .with_context(|| format!("error opening metadata store at {:?}", path.as_ref()))?;
        Ok(Self { db })
    }

    #[cfg(test)]
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("error opening temporary metadata store")?;
        Ok(Self { db })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key).context("error reading metadata key")? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("error deserializing metadata for key {key:?}"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .with_context(|| format!("error serializing metadata for key {key:?}"))?;
        self.db
            .insert(key, bytes)
            .with_context(|| format!("error writing metadata key {key:?}"))?;
        self.db.flush().context("error flushing metadata store")?;
        Ok(())
    }

    /// Iterate every value whose key starts with `prefix`.
    pub fn iterate<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (_key, bytes) = entry.context("error scanning metadata store")?;
            let value = serde_json::from_slice(&bytes).context("error deserializing metadata")?;
            out.push(value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        n: u32,
    }

    #[test]
    fn put_then_get_roundtrips() {
        let store = MetadataStore::open_temporary().unwrap();
        store.put("default/hello", &Sample { n: 7 }).unwrap();
        let got: Option<Sample> = store.get("default/hello").unwrap();
        assert_eq!(got, Some(Sample { n: 7 }));
    }

    #[test]
    fn missing_key_returns_none() {
        let store = MetadataStore::open_temporary().unwrap();
        let got: Option<Sample> = store.get("nope").unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn iterate_by_prefix() {
        let store = MetadataStore::open_temporary().unwrap();
        store.put("default/a", &Sample { n: 1 }).unwrap();
        store.put("default/b", &Sample { n: 2 }).unwrap();
        store.put("other/c", &Sample { n: 3 }).unwrap();

        let mut values: Vec<Sample> = store.iterate("default/").unwrap();
        values.sort_by_key(|s| s.n);
        assert_eq!(values, vec![Sample { n: 1 }, Sample { n: 2 }]);
    }
}

//! Builder dispatcher (C4): maps a language tag to an external builder, runs
//! it, hashes the result, and delegates to the registry's `push`.
//!
//! Builders are narrow external collaborators from the core's point of
//! view: the core only needs "verify the toolchain is present" and "build a
//! directory into a Wasm blob"; it does not vendor or reimplement any
//! language toolchain.

pub mod external;

use anyhow::Context;
use std::path::{Path, PathBuf};
use strum::EnumIter;

use crate::error::EngineError;
use crate::registry::{Registry, ResolvedVersion, VersionSettings};

/// Supported source languages, each dispatched to its external toolchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter)]
pub enum Language {
    Rust,
    TinyGo,
    JavaScript,
    TypeScript,
    AssemblyScript,
    Python,
}

impl Language {
    pub fn parse(tag: &str) -> Result<Self, EngineError> {
        Ok(match tag {
            "rust" => Self::Rust,
            "golang" | "go" | "tinygo" => Self::TinyGo,
            "javascript" | "js" => Self::JavaScript,
            "typescript" | "ts" => Self::TypeScript,
            "assemblyscript" | "as" => Self::AssemblyScript,
            "python" | "py" => Self::Python,
            other => {
                return Err(EngineError::BadRequest(format!(
                    "unsupported language {other:?}"
                )))
            }
        })
    }

    /// Name of the external toolchain binary this language shells out to.
    fn toolchain_binary(&self) -> &'static str {
        match self {
            Self::Rust => "cargo",
            Self::TinyGo => "tinygo",
            Self::JavaScript | Self::TypeScript => "extism-js",
            Self::AssemblyScript => "asc",
            Self::Python => "extism-py",
        }
    }
}

/// The capability every builder exposes: verify its toolchain is usable,
/// then build a source directory into a Wasm blob on disk.
#[async_trait::async_trait]
pub trait Builder: Send + Sync {
    async fn verify_dependencies(&self) -> anyhow::Result<()>;
    async fn build(&self, source_path: &Path) -> anyhow::Result<PathBuf>;
}

/// A builder that shells out to a single toolchain binary located on PATH.
pub struct ExternalBuilder {
    language: Language,
}

impl ExternalBuilder {
    pub fn new(language: Language) -> Self {
        Self { language }
    }
}

#[async_trait::async_trait]
impl Builder for ExternalBuilder {
    async fn verify_dependencies(&self) -> anyhow::Result<()> {
        external::locate(self.language.toolchain_binary()).map(|_| ())
    }

    async fn build(&self, source_path: &Path) -> anyhow::Result<PathBuf> {
        let binary = external::locate(self.language.toolchain_binary())?;
        let out = external::run_captured(&binary, &["build"] as &[&str], source_path)
            .await
            .context("error invoking builder toolchain")?;
        if !out.success {
            anyhow::bail!("builder exited with failure:\n{}", out.stderr);
        }
        // The toolchain is expected to place its output module here; the
        // exact layout is toolchain-specific and out of scope for the core.
        Ok(source_path.join("out.wasm"))
    }
}

/// Map a language tag to its builder. Unsupported languages fail `BadRequest`.
pub fn dispatch(language: &str) -> Result<Box<dyn Builder>, EngineError> {
    let language = Language::parse(language)?;
    Ok(Box::new(ExternalBuilder::new(language)))
}

/// Outcome of a successful build-and-push.
pub struct BuildOutcome {
    pub resolved: ResolvedVersion,
    pub reused: bool,
}

/// Run the language-appropriate builder over `source_path`, then push the
/// resulting blob into the registry under `(namespace, name)`.
#[tracing::instrument(level = "info", skip(registry, manifest))]
pub async fn build_and_push(
    registry: &Registry,
    namespace: &str,
    name: &str,
    language: &str,
    source_path: &Path,
    tag: Option<&str>,
    manifest: &serde_json::Value,
) -> Result<BuildOutcome, EngineError> {
    let builder = dispatch(language)?;
    builder
        .verify_dependencies()
        .await
        .map_err(|e| EngineError::BuildError(e.to_string()))?;

    let output_path = builder
        .build(source_path)
        .await
        .map_err(|e| EngineError::BuildError(e.to_string()))?;

    let payload = tokio::fs::read(&output_path)
        .await
        .with_context(|| format!("error reading build output at {output_path:?}"))
        .map_err(EngineError::Internal)?;

    let full_digest = crate::digest::compute_full_digest(&payload, manifest);

    let settings = VersionSettings {
        wasi: manifest
            .get("function")
            .and_then(|f| f.get("settings"))
            .and_then(|s| s.get("wasi"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        allowed_urls: manifest
            .get("function")
            .and_then(|f| f.get("settings"))
            .and_then(|s| s.get("allowed_urls"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    };

    let reused = registry
        .digest_exists(namespace, name, full_digest.as_str())
        .map_err(EngineError::Internal)?;

    let resolved = registry
        .push(
            namespace,
            name,
            &payload,
            &full_digest,
            tag,
            manifest,
            settings,
        )
        .await?;

    Ok(BuildOutcome { resolved, reused })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_languages() {
        assert_eq!(Language::parse("rust").unwrap(), Language::Rust);
        assert_eq!(Language::parse("golang").unwrap(), Language::TinyGo);
        assert_eq!(Language::parse("typescript").unwrap(), Language::TypeScript);
        assert_eq!(Language::parse("python").unwrap(), Language::Python);
    }

    #[test]
    fn parse_unknown_language_is_bad_request() {
        assert!(matches!(
            Language::parse("cobol"),
            Err(EngineError::BadRequest(_))
        ));
    }
}

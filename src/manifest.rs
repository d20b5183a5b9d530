//! Bootstrap manifests
//!
//! A bootstrap manifest is one YAML file that may hold several documents.
//! Files are applied in the order they are given and documents in the order
//! they appear, so CRDs in an early file can be instantiated by later ones.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::{Error, Result};

/// Kind of the CustomResourceDefinition type
pub const CRD_KIND: &str = "CustomResourceDefinition";

/// A single Kubernetes object parsed from a manifest
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDoc {
    /// Full object as JSON
    pub value: Value,
    /// `apiVersion` field
    pub api_version: String,
    /// `kind` field
    pub kind: String,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, if set
    pub namespace: Option<String>,
}

impl ManifestDoc {
    /// Extract the identifying metadata from a parsed object
    pub fn from_value(value: Value) -> Result<Self> {
        let field = |pointer: &str| value.pointer(pointer).and_then(Value::as_str);

        let api_version = field("/apiVersion")
            .ok_or_else(|| Error::config("manifest document missing apiVersion"))?
            .to_string();
        let kind = field("/kind")
            .ok_or_else(|| Error::config("manifest document missing kind"))?
            .to_string();
        let name = field("/metadata/name")
            .ok_or_else(|| Error::config(format!("{} document missing metadata.name", kind)))?
            .to_string();
        let namespace = field("/metadata/namespace").map(str::to_string);

        Ok(Self {
            value,
            api_version,
            kind,
            name,
            namespace,
        })
    }

    /// `(group, version)` split of `apiVersion`; the core group is `""`
    pub fn group_version(&self) -> (String, String) {
        parse_api_version(&self.api_version)
    }

    /// Whether this document defines a CRD
    pub fn is_crd(&self) -> bool {
        self.kind == CRD_KIND
    }

    /// Short `Kind/name` reference for logs and the applied-manifest ledger
    pub fn reference(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}/{}", self.kind, ns, self.name),
            None => format!("{}/{}", self.kind, self.name),
        }
    }
}

/// One bootstrap file: an ordered list of documents
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapManifest {
    /// Source name (file name or a label for inline manifests)
    pub source: String,
    /// Documents in file order
    pub documents: Vec<ManifestDoc>,
}

impl BootstrapManifest {
    /// Parse a multi-document YAML string
    pub fn parse(source: impl Into<String>, yaml: &str) -> Result<Self> {
        let source = source.into();
        let documents = parse_documents(yaml)
            .map_err(|e| Error::config(format!("{}: {}", source, e)))?;
        Ok(Self { source, documents })
    }

    /// Read and parse a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read manifest {}: {}", path.display(), e))
        })?;
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self::parse(source, &content)
    }

    /// Load several files, preserving the given order
    pub fn load_all(paths: &[impl AsRef<Path>]) -> Result<Vec<Self>> {
        paths.iter().map(|p| Self::load(p.as_ref())).collect()
    }
}

/// Parse every non-empty document of a multi-document YAML stream
pub fn parse_documents(yaml: &str) -> Result<Vec<ManifestDoc>> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        docs.push(ManifestDoc::from_value(value)?);
    }
    Ok(docs)
}

/// Parse apiVersion into (group, version)
///
/// ```
/// use gateway_conformance::manifest::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

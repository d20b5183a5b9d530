//! API client factory
//!
//! Builds the typed client the conformance tests run through. Every schema the
//! test registry depends on is resolved up front against the cluster and
//! recorded in the returned [`ApiClient`]. A test that later reaches for a kind
//! nobody registered gets [`Error::SchemaNotRegistered`] instead of an opaque
//! decode failure.
//!
//! The set of schemas is an explicit [`SchemaRegistry`] value handed to the
//! factory; nothing is registered process-wide.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::cluster::{ClusterHandle, Credentials};
use crate::manifest::ManifestDoc;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result, FIELD_MANAGER};

/// Connection timeout for API clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for API clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";

/// A resource type the conformance tests need to read or write
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Schema {
    /// API group ("" for core)
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
}

impl Schema {
    /// Create a schema entry
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    fn key(&self) -> (String, String) {
        (self.group.clone(), self.kind.clone())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// The schemas a client must know before tests start.
///
/// Keyed by `(group, kind)`; registering a kind twice keeps the last version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRegistry {
    schemas: BTreeMap<(String, String), Schema>,
}

impl SchemaRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Core and apps types every manifest-driven test uses
    pub fn core() -> Self {
        let mut registry = Self::new();
        registry.register_all([
            Schema::new("", "v1", "Namespace"),
            Schema::new("", "v1", "Service"),
            Schema::new("", "v1", "Secret"),
            Schema::new("", "v1", "ConfigMap"),
            Schema::new("", "v1", "Pod"),
            Schema::new("apps", "v1", "Deployment"),
        ]);
        registry
    }

    /// Gateway API types across channels, plus API extension metadata types
    pub fn gateway_api() -> Self {
        let mut registry = Self::core();
        registry.register_all([
            Schema::new(GATEWAY_GROUP, "v1", "GatewayClass"),
            Schema::new(GATEWAY_GROUP, "v1", "Gateway"),
            Schema::new(GATEWAY_GROUP, "v1", "HTTPRoute"),
            Schema::new(GATEWAY_GROUP, "v1", "GRPCRoute"),
            Schema::new(GATEWAY_GROUP, "v1beta1", "ReferenceGrant"),
            Schema::new(GATEWAY_GROUP, "v1alpha2", "TLSRoute"),
            Schema::new(GATEWAY_GROUP, "v1alpha2", "TCPRoute"),
            Schema::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
        ]);
        registry
    }

    /// Add a schema
    pub fn register(&mut self, schema: Schema) {
        self.schemas.insert(schema.key(), schema);
    }

    /// Add several schemas
    pub fn register_all(&mut self, schemas: impl IntoIterator<Item = Schema>) {
        for schema in schemas {
            self.register(schema);
        }
    }

    /// Whether `(group, kind)` is registered
    pub fn contains(&self, group: &str, kind: &str) -> bool {
        self.schemas
            .contains_key(&(group.to_string(), kind.to_string()))
    }

    /// Registered schemas in `(group, kind)` order
    pub fn iter(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.values()
    }

    /// Number of registered schemas
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// A schema resolved against the live API server
#[derive(Debug, Clone)]
pub struct ResolvedSchema {
    /// Resource description (plural, version) used to build dynamic APIs
    pub resource: ApiResource,
    /// Whether the kind is namespace-scoped
    pub namespaced: bool,
}

/// Typed client plus the rest config it was built from
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    config: Config,
    resolved: BTreeMap<(String, String), ResolvedSchema>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("cluster_url", &self.config.cluster_url)
            .field("schemas", &self.resolved.len())
            .finish()
    }
}

impl ApiClient {
    /// Wrap a client with no schemas registered
    pub fn new(client: Client, config: Config) -> Self {
        Self {
            client,
            config,
            resolved: BTreeMap::new(),
        }
    }

    /// Record a resolved schema
    pub fn register_resolved(&mut self, schema: &Schema, resolved: ResolvedSchema) {
        self.resolved.insert(schema.key(), resolved);
    }

    /// The underlying kube client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The rest config the client was built from
    pub fn rest_config(&self) -> &Config {
        &self.config
    }

    /// Whether `(group, kind)` was registered
    pub fn is_registered(&self, group: &str, kind: &str) -> bool {
        self.resolved
            .contains_key(&(group.to_string(), kind.to_string()))
    }

    /// Look up a registered schema
    pub fn schema(&self, group: &str, kind: &str) -> Result<&ResolvedSchema> {
        self.resolved
            .get(&(group.to_string(), kind.to_string()))
            .ok_or_else(|| Error::schema_not_registered(group, kind))
    }

    /// Dynamic API for a registered kind.
    ///
    /// Namespaced kinds use `namespace` (or `default`); cluster-scoped kinds
    /// ignore it.
    pub fn dynamic_api(
        &self,
        group: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>> {
        let schema = self.schema(group, kind)?;
        Ok(if schema.namespaced {
            Api::namespaced_with(
                self.client.clone(),
                namespace.unwrap_or("default"),
                &schema.resource,
            )
        } else {
            Api::all_with(self.client.clone(), &schema.resource)
        })
    }

    /// Server-side apply a document whose kind is registered
    pub async fn apply(&self, doc: &ManifestDoc) -> Result<()> {
        let (group, _) = doc.group_version();
        let api = self.dynamic_api(&group, &doc.kind, doc.namespace.as_deref())?;
        api.patch(
            &doc.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&doc.value),
        )
        .await?;
        debug!(manifest = %doc.reference(), "applied");
        Ok(())
    }

    /// Delete a document's object; a missing object is not an error
    pub async fn delete(&self, doc: &ManifestDoc) -> Result<()> {
        let (group, _) = doc.group_version();
        let api = self.dynamic_api(&group, &doc.kind, doc.namespace.as_deref())?;
        match api.delete(&doc.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Build a rest config from cluster credentials
pub async fn rest_config(credentials: &Credentials) -> Result<Config> {
    let kubeconfig = Kubeconfig::from_yaml(&credentials.kubeconfig).map_err(|e| {
        Error::provision("credentials", format!("invalid kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::provision("credentials", format!("failed to load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(config)
}

/// Source of API clients for a provisioned cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientBuilder: Send + Sync {
    /// Build a client for `cluster` with every schema in `schemas` registered
    async fn build(&self, cluster: &ClusterHandle, schemas: &SchemaRegistry) -> Result<ApiClient>;
}

/// Builds [`ApiClient`]s for provisioned clusters
#[derive(Debug, Clone, Default)]
pub struct ClientFactory {
    retry: RetryConfig,
}

impl ClientFactory {
    /// Factory with the default discovery retry policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a client for `cluster` and register every schema in `schemas`.
    ///
    /// Fails with [`Error::SchemaNotRegistered`] if the cluster does not serve
    /// one of the requested schemas. Only reads from the cluster.
    #[instrument(skip_all, fields(cluster = %cluster.name, schemas = schemas.len()))]
    pub async fn build(&self, cluster: &ClusterHandle, schemas: &SchemaRegistry) -> Result<ApiClient> {
        let config = rest_config(cluster.credentials()?).await?;
        let client = Client::try_from(config.clone())?;

        let discovery = {
            let client = client.clone();
            retry_with_backoff(&self.retry, "api-discovery", || {
                let client = client.clone();
                async move { Discovery::new(client).run().await }
            })
            .await?
        };

        let mut api_client = ApiClient::new(client, config);
        for schema in schemas.iter() {
            let (resource, caps) = discovery
                .resolve_gvk(&schema.gvk())
                .ok_or_else(|| Error::schema_not_registered(&schema.group, &schema.kind))?;
            debug!(schema = %schema, plural = %resource.plural, "registered schema");
            api_client.register_resolved(
                schema,
                ResolvedSchema {
                    resource,
                    namespaced: caps.scope == Scope::Namespaced,
                },
            );
        }

        info!(count = schemas.len(), "API client ready");
        Ok(api_client)
    }
}

#[async_trait]
impl ClientBuilder for ClientFactory {
    async fn build(&self, cluster: &ClusterHandle, schemas: &SchemaRegistry) -> Result<ApiClient> {
        ClientFactory::build(self, cluster, schemas).await
    }
}

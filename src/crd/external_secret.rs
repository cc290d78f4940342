//! # ExternalSecret
//!
//! Declares which remote values to mirror into which Kubernetes `Secret`.
//!
//! # Example
//!
//! ```yaml
//! apiVersion: secretsync.octopilot.io/v1beta1
//! kind: ExternalSecret
//! metadata:
//!   name: db-credentials
//!   namespace: team-a
//! spec:
//!   secretStoreRef:
//!     name: vault-backend
//!   refreshInterval: 15s
//!   target:
//!     creationPolicy: Owner
//!   data:
//!     - secretKey: username
//!       remoteRef: { key: database/postgres, property: username }
//!     - secretKey: password
//!       remoteRef: { key: database/postgres, property: password }
//! ```

use crate::constants::{DEFAULT_REFRESH_INTERVAL, DEFAULT_SECRET_TYPE, DEFAULT_TEMPLATE_KEY};
use crate::controller::descriptor::{
    CreationPolicy, DataFromSource, DescriptorStatus, FieldMapping, ObjectIdentity, RemoteRef,
    SecretDescriptor, TemplateSpec,
};
use crate::controller::duration::parse_kubernetes_duration;
use crate::provider::BackendId;
use anyhow::{Context, Result};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ExternalSecret",
    group = "secretsync.octopilot.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::ExternalSecretStatus",
    shortname = "es",
    printcolumn = r#"{"name":"Store", "type":"string", "jsonPath":".spec.secretStoreRef.name"}, {"name":"Refresh", "type":"string", "jsonPath":".spec.refreshInterval"}, {"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSecretSpec {
    pub secret_store_ref: SecretStoreRef,
    /// Kubernetes duration string (e.g. "15s", "5m", "1h")
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
    #[serde(default)]
    pub target: ExternalSecretTarget,
    #[serde(default)]
    pub data: Vec<ExternalSecretData>,
    #[serde(default)]
    pub data_from: Vec<DataFromSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretStoreRef {
    pub name: String,
    #[serde(default)]
    pub kind: StoreKind,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
pub enum StoreKind {
    #[default]
    SecretStore,
    ClusterSecretStore,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSecretTarget {
    /// Name of the destination Secret, defaults to the ExternalSecret's name
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub creation_policy: CreationPolicySpec,
    #[serde(default)]
    pub template: Option<ExternalSecretTemplate>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
pub enum CreationPolicySpec {
    #[default]
    Owner,
    Merge,
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSecretTemplate {
    /// Destination Secret type
    #[serde(rename = "type", default = "default_secret_type")]
    pub secret_type: String,
    /// Key the rendered body is stored under
    #[serde(default = "default_template_key")]
    pub key: String,
    /// Template text with `{{ .field }}` placeholders
    pub body: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSecretData {
    pub secret_key: String,
    pub remote_ref: RemoteRefSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRefSpec {
    pub key: String,
    #[serde(default)]
    pub property: Option<String>,
}

/// Exactly one of `extract` or `find` must be set
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataFromSpec {
    #[serde(default)]
    pub extract: Option<ExtractSpec>,
    #[serde(default)]
    pub find: Option<FindSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtractSpec {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FindSpec {
    pub prefix: String,
}

fn default_refresh_interval() -> String {
    DEFAULT_REFRESH_INTERVAL.to_string()
}

fn default_secret_type() -> String {
    DEFAULT_SECRET_TYPE.to_string()
}

fn default_template_key() -> String {
    DEFAULT_TEMPLATE_KEY.to_string()
}

impl ExternalSecret {
    /// Registry identity of this resource
    ///
    /// # Errors
    /// Returns an error if the resource has no namespace.
    pub fn identity(&self) -> Result<ObjectIdentity> {
        let namespace = self
            .namespace()
            .with_context(|| format!("ExternalSecret {} has no namespace", self.name_any()))?;
        Ok(ObjectIdentity::new(namespace, self.name_any()))
    }

    #[must_use]
    pub fn backend_id(&self, namespace: &str) -> BackendId {
        let store = &self.spec.secret_store_ref;
        match store.kind {
            StoreKind::SecretStore => BackendId::namespaced(namespace, store.name.clone()),
            StoreKind::ClusterSecretStore => BackendId::cluster(store.name.clone()),
        }
    }

    /// Convert into a descriptor
    ///
    /// Structural invariants (unique keys, interval bounds) are enforced when
    /// the descriptor is registered.
    ///
    /// # Errors
    /// Returns an error for a missing namespace, an unparseable refresh interval
    /// or a `dataFrom` entry that does not set exactly one source.
    pub fn to_descriptor(&self) -> Result<SecretDescriptor> {
        let id = self.identity()?;
        let spec = &self.spec;

        let refresh_interval = parse_kubernetes_duration(&spec.refresh_interval)
            .with_context(|| format!("invalid refreshInterval on {id}"))?;

        let mappings = spec
            .data
            .iter()
            .map(|d| FieldMapping {
                secret_key: d.secret_key.clone(),
                remote_ref: RemoteRef {
                    key: d.remote_ref.key.clone(),
                    property: d.remote_ref.property.clone(),
                },
            })
            .collect();

        let data_from = spec
            .data_from
            .iter()
            .enumerate()
            .map(|(index, source)| match (&source.extract, &source.find) {
                (Some(extract), None) => Ok(DataFromSource::Extract {
                    key: extract.key.clone(),
                }),
                (None, Some(find)) => Ok(DataFromSource::Find {
                    prefix: find.prefix.clone(),
                }),
                _ => Err(anyhow::anyhow!(
                    "dataFrom[{index}] on {id} must set exactly one of extract or find"
                )),
            })
            .collect::<Result<Vec<_>>>()?;

        let template = spec.target.template.as_ref().map(|t| TemplateSpec {
            body: t.body.clone(),
            secret_type: t.secret_type.clone(),
            key: t.key.clone(),
        });

        let creation_policy = match spec.target.creation_policy {
            CreationPolicySpec::Owner => CreationPolicy::Owner,
            CreationPolicySpec::Merge => CreationPolicy::Merge,
            CreationPolicySpec::None => CreationPolicy::None,
        };

        let target_name = spec.target.name.clone().unwrap_or_else(|| id.name.clone());
        Ok(SecretDescriptor {
            backend: self.backend_id(&id.namespace),
            target: ObjectIdentity::new(id.namespace.clone(), target_name),
            id,
            mappings,
            data_from,
            template,
            refresh_interval,
            creation_policy,
            status: DescriptorStatus::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn external_secret(spec: serde_json::Value) -> ExternalSecret {
        let spec: ExternalSecretSpec = serde_json::from_value(spec).unwrap();
        let mut es = ExternalSecret::new("db-credentials", spec);
        es.metadata.namespace = Some("team-a".to_string());
        es
    }

    #[test]
    fn test_defaults() {
        let es = external_secret(serde_json::json!({
            "secretStoreRef": { "name": "vault-backend" },
            "data": [
                { "secretKey": "password", "remoteRef": { "key": "database/postgres", "property": "password" } }
            ]
        }));
        let d = es.to_descriptor().unwrap();
        assert_eq!(d.id, ObjectIdentity::new("team-a", "db-credentials"));
        assert_eq!(d.target, d.id);
        assert_eq!(d.backend, BackendId::namespaced("team-a", "vault-backend"));
        assert_eq!(d.refresh_interval, Duration::from_secs(3600));
        assert_eq!(d.creation_policy, CreationPolicy::Owner);
        assert_eq!(d.mappings.len(), 1);
    }

    #[test]
    fn test_template_and_cluster_store() {
        let es = external_secret(serde_json::json!({
            "secretStoreRef": { "name": "shared", "kind": "ClusterSecretStore" },
            "refreshInterval": "5m",
            "target": {
                "name": "dsn",
                "creationPolicy": "Merge",
                "template": { "body": "postgres://{{ .username }}@db" }
            },
            "data": [
                { "secretKey": "username", "remoteRef": { "key": "database/postgres", "property": "username" } }
            ]
        }));
        let d = es.to_descriptor().unwrap();
        assert_eq!(d.backend, BackendId::cluster("shared"));
        assert_eq!(d.target, ObjectIdentity::new("team-a", "dsn"));
        assert_eq!(d.creation_policy, CreationPolicy::Merge);
        let template = d.template.unwrap();
        assert_eq!(template.key, "value");
        assert_eq!(template.secret_type, "Opaque");
    }

    #[test]
    fn test_invalid_data_from() {
        let es = external_secret(serde_json::json!({
            "secretStoreRef": { "name": "vault-backend" },
            "dataFrom": [ {} ]
        }));
        assert!(es.to_descriptor().is_err());
    }

    #[test]
    fn test_invalid_refresh_interval() {
        let es = external_secret(serde_json::json!({
            "secretStoreRef": { "name": "vault-backend" },
            "refreshInterval": "soon",
            "dataFrom": [ { "find": { "prefix": "apps/" } } ]
        }));
        assert!(es.to_descriptor().is_err());
    }
}

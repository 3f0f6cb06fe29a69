//! Secret store adapter.
//!
//! Secret plaintext enters the engine as [`SecretMaterial`] and only ever
//! crosses into a [`SecretVault`]. Consumers never see it: they embed a
//! [`SecretRef`] that resolves to a `{"$secretRef": {...}}` marker which the
//! provider dereferences when it materializes the consuming resource.
//!
//! [`SecretStore::create_or_update_secret`] allocates a new version only when
//! the material's digest changes, so re-applying an unchanged secret is free
//! while a rotation produces a new version that every `Latest` consumer picks
//! up as a change to its own desired state.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use keel_core::canonical_json::fingerprint;
use keel_core::{NodeId, PhysicalId, Redacted};

use crate::provider::collaborators::SecretVault;
use crate::provider::{ProviderError, ProviderResult};

/// Key of the marker object a secret reference resolves to.
pub const SECRET_REF_MARKER: &str = "$secretRef";

/// Which version of a secret a consumer reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretVersion {
    /// Always the current version; rotations propagate to the consumer.
    #[default]
    Latest,
    /// A fixed version.
    Pinned(u64),
}

/// Typed reference to a secret owned by another node.
///
/// Carries no plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Node ID of the secret.
    pub secret: NodeId,
    /// Version to read.
    #[serde(default)]
    pub version: SecretVersion,
    /// Key inside a composite JSON secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

impl SecretRef {
    /// References the latest version of `secret`.
    #[must_use]
    pub const fn latest(secret: NodeId) -> Self {
        Self {
            secret,
            version: SecretVersion::Latest,
            key_path: None,
        }
    }

    /// References a fixed version of `secret`.
    #[must_use]
    pub const fn pinned(secret: NodeId, version: u64) -> Self {
        Self {
            secret,
            version: SecretVersion::Pinned(version),
            key_path: None,
        }
    }

    /// Selects a key inside a composite secret.
    #[must_use]
    pub fn with_key_path(mut self, key_path: impl Into<String>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Builds the marker object a provider dereferences.
    ///
    /// With `version = None` the version is rendered as `"latest"`; this is
    /// the form used for configuration fingerprints.
    #[must_use]
    pub fn marker(&self, secret_id: &str, version: Option<u64>) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("secretId".into(), json!(secret_id));
        body.insert(
            "version".into(),
            version.map_or_else(|| json!("latest"), |v| json!(v)),
        );
        if let Some(path) = &self.key_path {
            body.insert("keyPath".into(), json!(path));
        }
        let mut marker = serde_json::Map::new();
        marker.insert(SECRET_REF_MARKER.to_string(), Value::Object(body));
        Value::Object(marker)
    }
}

/// Secret plaintext. `Debug`, `Display` and serialization never reveal it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretMaterial(Redacted<Value>);

impl SecretMaterial {
    /// Wraps a structured secret value.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self(Redacted::new(value))
    }

    /// Returns the plaintext. Only vault implementations should call this.
    #[must_use]
    pub const fn expose(&self) -> &Value {
        self.0.expose()
    }

    /// SHA-256 digest of the canonical plaintext encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be canonicalized.
    pub fn digest(&self) -> keel_core::Result<String> {
        Ok(fingerprint(self.expose())?)
    }
}

/// The current version of a stored secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretEntry {
    /// Vault identity of the secret.
    pub secret_id: PhysicalId,
    /// Current version number, starting at 1.
    pub version: u64,
    /// Digest of the material stored under `version`.
    pub digest: String,
}

/// Adapter between secret nodes and a [`SecretVault`].
pub struct SecretStore {
    vault: Arc<dyn SecretVault>,
    entries: RwLock<BTreeMap<NodeId, SecretEntry>>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore").finish_non_exhaustive()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> ProviderError {
    ProviderError::permanent("secret store lock poisoned")
}

impl SecretStore {
    /// Creates an adapter over `vault` with no known secrets.
    #[must_use]
    pub fn new(vault: Arc<dyn SecretVault>) -> Self {
        Self {
            vault,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registers a secret known from a previous apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn restore(&self, node: NodeId, entry: SecretEntry) -> ProviderResult<()> {
        self.entries.write().map_err(poison_err)?.insert(node, entry);
        Ok(())
    }

    /// Returns the current entry for a secret node.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn current(&self, node: &NodeId) -> ProviderResult<Option<SecretEntry>> {
        Ok(self.entries.read().map_err(poison_err)?.get(node).cloned())
    }

    /// Stores `material` for `node`, allocating a new version only when the
    /// content changed.
    ///
    /// # Errors
    ///
    /// Returns the vault's error, or a permanent error if the material
    /// cannot be digested.
    #[tracing::instrument(skip(self, material), fields(node_id = %node))]
    pub async fn create_or_update_secret(
        &self,
        node: &NodeId,
        name: &str,
        material: &SecretMaterial,
    ) -> ProviderResult<SecretEntry> {
        let digest = material
            .digest()
            .map_err(|e| ProviderError::permanent(format!("cannot digest secret: {e}")))?;

        let entry = match self.current(node)? {
            Some(existing) if existing.digest == digest => {
                tracing::debug!(version = existing.version, "secret content unchanged");
                return Ok(existing);
            }
            Some(existing) => {
                let version = self
                    .vault
                    .put_secret_value(&existing.secret_id, material)
                    .await?;
                SecretEntry {
                    secret_id: existing.secret_id,
                    version,
                    digest,
                }
            }
            None => {
                let (secret_id, version) = self.vault.create_secret(name, material).await?;
                SecretEntry {
                    secret_id,
                    version,
                    digest,
                }
            }
        };

        tracing::info!(secret_id = %entry.secret_id, version = entry.version, "secret version stored");
        self.entries
            .write()
            .map_err(poison_err)?
            .insert(node.clone(), entry.clone());
        Ok(entry)
    }

    /// Deletes the secret from the vault and forgets it.
    ///
    /// # Errors
    ///
    /// Returns the vault's error.
    #[tracing::instrument(skip(self), fields(node_id = %node))]
    pub async fn delete_secret(&self, node: &NodeId, secret_id: &PhysicalId) -> ProviderResult<()> {
        self.vault.delete_secret(secret_id).await?;
        self.entries.write().map_err(poison_err)?.remove(node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::InMemoryVault;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn material_never_prints_plaintext() {
        let material = SecretMaterial::new(json!({"password": "hunter2"}));
        assert!(!format!("{material:?}").contains("hunter2"));
        assert!(!serde_json::to_string(&material).unwrap().contains("hunter2"));
    }

    #[test]
    fn marker_renders_latest_and_pinned() {
        let reference = SecretRef::latest(node("db-secret")).with_key_path("password");
        assert_eq!(
            reference.marker("arn:secret:db", Some(3)),
            json!({"$secretRef": {"secretId": "arn:secret:db", "version": 3, "keyPath": "password"}})
        );
        assert_eq!(
            reference.marker("arn:secret:db", None)["$secretRef"]["version"],
            "latest"
        );
    }

    #[test]
    fn secret_ref_deserializes_with_defaults() {
        let reference: SecretRef = serde_json::from_value(json!({"secret": "email-secret"})).unwrap();
        assert_eq!(reference.version, SecretVersion::Latest);
        assert!(reference.key_path.is_none());
        let pinned: SecretRef =
            serde_json::from_value(json!({"secret": "db", "version": {"pinned": 2}})).unwrap();
        assert_eq!(pinned.version, SecretVersion::Pinned(2));
    }

    #[tokio::test]
    async fn unchanged_content_keeps_version() {
        let vault = Arc::new(InMemoryVault::new());
        let store = SecretStore::new(vault.clone());
        let material = SecretMaterial::new(json!({"user": "app", "password": "a"}));

        let first = store
            .create_or_update_secret(&node("db"), "database-secret", &material)
            .await
            .unwrap();
        let second = store
            .create_or_update_secret(&node("db"), "database-secret", &material)
            .await
            .unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(first, second);
        assert_eq!(vault.calls().create_secret, 1);
        assert_eq!(vault.calls().put_secret_value, 0);
    }

    #[tokio::test]
    async fn changed_content_allocates_new_version_same_id() {
        let vault = Arc::new(InMemoryVault::new());
        let store = SecretStore::new(vault.clone());

        let v1 = store
            .create_or_update_secret(&node("db"), "database-secret", &SecretMaterial::new(json!({"password": "a"})))
            .await
            .unwrap();
        let v2 = store
            .create_or_update_secret(&node("db"), "database-secret", &SecretMaterial::new(json!({"password": "b"})))
            .await
            .unwrap();

        assert_eq!(v1.secret_id, v2.secret_id);
        assert_eq!(v2.version, 2);
        assert_ne!(v1.digest, v2.digest);
    }

    #[tokio::test]
    async fn delete_forgets_entry() {
        let vault = Arc::new(InMemoryVault::new());
        let store = SecretStore::new(vault.clone());
        let entry = store
            .create_or_update_secret(&node("email"), "email-secret", &SecretMaterial::new(json!("k")))
            .await
            .unwrap();
        store.delete_secret(&node("email"), &entry.secret_id).await.unwrap();
        assert!(store.current(&node("email")).unwrap().is_none());
        assert_eq!(vault.calls().delete_secret, 1);
    }
}

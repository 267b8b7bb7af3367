//! The store abstraction over secret plans and their instances.
//!
//! Implemented by the journal-backed [`crate::lifecycle::LifecycleController`]
//! and by the CLI's HTTP client, so every front-end command works the same
//! against a local database or a running agent.

use async_trait::async_trait;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;
use crate::instance::{Instance, Instances};
use crate::operation::{Operation, OperationName, OperationParameters, Range};
use crate::secrets::{Secret, Secrets};

/// Read and mutate secrets and their instances.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// All configured secret plans. The journal is not consulted.
    async fn list_secrets(&self) -> Result<Secrets>;

    /// The configured plan with the given id.
    async fn get_secret(&self, secret_id: &str) -> Result<Secret>;

    /// Operations recorded against the secret, newest first.
    async fn secret_history(&self, secret_id: &str, range: Range) -> Result<Vec<Operation>>;

    /// Every instance of the secret with its latest operation joined as
    /// status, ordered by that operation's id, newest first.
    async fn list_instances(&self, secret_id: &str, range: Range) -> Result<Instances>;

    /// One instance of the secret.
    async fn get_instance(&self, secret_id: &str, instance_id: &str) -> Result<Instance>;

    /// The currently-active instance of the secret, if any.
    async fn get_active(&self, secret_id: &str) -> Result<Option<Instance>>;

    /// Creates a new instance by running the plan's `create` operation.
    async fn create(&self, secret_id: &str, parameters: OperationParameters) -> Result<Instance>;

    /// Runs a non-create operation against an existing instance.
    async fn operate(
        &self,
        secret_id: &str,
        instance_id: &str,
        name: OperationName,
        parameters: OperationParameters,
    ) -> Result<Instance>;

    /// Operations recorded against one instance, newest first.
    async fn instance_history(
        &self,
        secret_id: &str,
        instance_id: &str,
        range: Range,
    ) -> Result<Vec<Operation>>;
}

/// Wire wrapper for listings: `{"items": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Items<T> {
    /// The listed values, keyed by id.
    pub items: T,
}

/// The secrets catalog keyed by id for the wire, in catalog order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretsById(
    /// The wrapped catalog.
    pub Secrets,
);

impl Serialize for SecretsById {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for secret in self.0.iter() {
            map.serialize_entry(&secret.id, secret)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SecretsById {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SecretsVisitor;

        impl<'de> Visitor<'de> for SecretsVisitor {
            type Value = SecretsById;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of secret id to secret plan")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut secrets = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((_, secret)) = access.next_entry::<String, Secret>()? {
                    secrets.push(secret);
                }
                let secrets = Secrets::new(secrets).map_err(serde::de::Error::custom)?;
                Ok(SecretsById(secrets))
            }
        }

        deserializer.deserialize_map(SecretsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_secrets_round_trip() {
        let secrets: Secrets =
            serde_json::from_str(r#"[{"id":"b","create":"echo b"},{"id":"a"}]"#).unwrap();
        let wire = serde_json::to_string(&Items {
            items: SecretsById(secrets.clone()),
        })
        .unwrap();
        assert!(wire.starts_with(r#"{"items":{"b":"#));
        let back: Items<SecretsById> = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.items.0, secrets);
    }
}

//! Provisioned secret instances.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::operation::Status;
use crate::secrets::Secret;

/// A provisioned instance of a secret.
///
/// The plan is embedded, not referenced: it is the frozen copy captured when
/// the instance was created, so later operations run the originally-declared
/// commands even if the catalog has since been edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// The unique id of the secret instance.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// The plan for managing this secret, pinned at creation time.
    pub secret: Secret,

    /// The current status of the instance: its latest operation.
    pub status: Status,
}

/// Instances of one secret, ordered by their latest operation, newest first.
///
/// On the wire this is a JSON object keyed by instance id; JSON objects keep
/// insertion order through serde_json, so the ordering survives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instances(
    /// The instances, newest first.
    pub Vec<Instance>,
);

impl Instances {
    /// Looks an instance up by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.0.iter().find(|instance| instance.id == id)
    }

    /// Number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates newest-first.
    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.0.iter()
    }
}

impl Serialize for Instances {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for instance in &self.0 {
            map.serialize_entry(&instance.id, instance)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Instances {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct InstancesVisitor;

        impl<'de> Visitor<'de> for InstancesVisitor {
            type Value = Instances;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of instance id to instance")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut instances = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((id, mut instance)) = access.next_entry::<String, Instance>()? {
                    if instance.id.is_empty() {
                        instance.id = id;
                    }
                    instances.push(instance);
                }
                Ok(Instances(instances))
            }
        }

        deserializer.deserialize_map(InstancesVisitor)
    }
}

//! Secret plans: named lifecycle plans as trees of shell commands.
//!
//! A plan node carries up to one command per operation name and an ordered
//! list of derived child plans. Processing an operation is a depth-first
//! traversal in which each node's captured stdout seeds the stdin of its
//! derived children.

use std::future::Future;
use std::pin::Pin;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::environment::Environment;
use crate::error::Result;
use crate::operation::{OperationName, OperationParameters};

/// A plan for the provisioning of a secret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    /// The name of the secret, unique among its siblings.
    pub id: String,

    /// The environment variables for the secret plan.
    #[serde(default, skip_serializing_if = "Environment::is_empty")]
    pub environment: Environment,

    /// Create a new instance of the secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<Command>,

    /// Destroy an instance of the secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroy: Option<Command>,

    /// Activate an instance of the secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activate: Option<Command>,

    /// Deactivate an instance of the secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivate: Option<Command>,

    /// Test the active secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<Command>,

    /// Derived secrets, processed in declaration order.
    #[serde(default, skip_serializing_if = "Secrets::is_empty")]
    pub derived: Secrets,
}

/// An ordered collection of sibling plans with unique ids.
///
/// Serialized as a JSON array; source order is preserved because derived
/// children observe their parent's output in sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Secrets(Vec<Secret>);

impl Secrets {
    /// Validates sibling ids: non-empty and unique.
    pub fn new(secrets: Vec<Secret>) -> Result<Self, String> {
        for (i, secret) in secrets.iter().enumerate() {
            if secret.id.is_empty() {
                return Err("secret id must not be empty".to_string());
            }
            if secrets[..i].iter().any(|other| other.id == secret.id) {
                return Err(format!("secret id '{}' must be unique", secret.id));
            }
        }
        Ok(Self(secrets))
    }

    /// Looks a sibling up by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Secret> {
        self.0.iter().find(|secret| secret.id == id)
    }

    /// Whether there are no plans.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of plans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Secret> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for Secrets {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let secrets = Vec::<Secret>::deserialize(deserializer)?;
        Self::new(secrets).map_err(D::Error::custom)
    }
}

impl Secret {
    /// The command declared for `operation`, if any.
    #[must_use]
    pub fn command(&self, operation: OperationName) -> Option<&Command> {
        match operation {
            OperationName::Create => self.create.as_ref(),
            OperationName::Destroy => self.destroy.as_ref(),
            OperationName::Activate => self.activate.as_ref(),
            OperationName::Deactivate => self.deactivate.as_ref(),
            OperationName::Test => self.test.as_ref(),
        }
    }

    /// Runs `operation` over this node and its derived children,
    /// depth-first.
    ///
    /// At each node the effective environment is built from (lowest to
    /// highest priority) the parameters' environment, the fixed set `ID`,
    /// `NAME`, `QID`, `QNAME`, `FORCE`, `REASON` and `STARTED_BY`, and the
    /// node's declared environment expanded against both. `QNAME` and `QID`
    /// give child scripts stable hierarchical identifiers without the agent
    /// dictating a naming scheme.
    ///
    /// A node without a command for `operation` contributes empty output to
    /// its children.
    pub fn process<'a>(
        &'a self,
        operation: OperationName,
        input: Vec<u8>,
        parameters: &'a OperationParameters,
        instance_id: &'a str,
        token: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut env = parameters.env.clone();
            let qname = match parameters.env.get("QNAME") {
                Some(parent) => format!("{parent}/{}", self.id),
                None => self.id.clone(),
            };
            env.set("ID", instance_id);
            env.set("NAME", &self.id);
            env.set("QID", format!("{qname}/{instance_id}"));
            env.set("QNAME", qname);
            env.set("FORCE", if parameters.forced { "true" } else { "false" });
            env.set("REASON", &parameters.reason);
            env.set("STARTED_BY", &parameters.started_by);
            let env = self.environment.expand_and_merge_with(&env);

            let output = match self.command(operation) {
                Some(command) => command.process(&input, &env, token).await?,
                None => Vec::new(),
            };

            let parameters = OperationParameters {
                env,
                forced: parameters.forced,
                reason: parameters.reason.clone(),
                started_by: parameters.started_by.clone(),
            };
            for derived in self.derived.iter() {
                derived
                    .process(operation, output.clone(), &parameters, instance_id, token)
                    .await?;
            }
            Ok(())
        })
    }
}

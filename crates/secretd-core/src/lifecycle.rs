//! The lifecycle controller: admission, execution, and journalling of
//! secret operations.
//!
//! Every operation runs in three phases:
//!
//! - **Phase A** (one transaction): read the instance's current state,
//!   evaluate the admission guards, append the started operation row. An
//!   `activate` also points the secret at the instance here, so a partially
//!   successful script still leaves the instance visible as possibly-active
//!   for cleanup.
//! - **Phase B** (no journal lock held): drive the plan tree pinned on the
//!   instance row.
//! - **Phase C** (one transaction): stamp `completed_at` or `failed_at`. A
//!   successful `deactivate` clears the active pointer iff it still points
//!   at the operated instance.
//!
//! The split makes every attempt a durable, auditable event even when a
//! script hangs or the host crashes mid-run: an interrupted operation is
//! left with `started_at` set and both terminal timestamps null.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::instance::{Instance, Instances};
use crate::journal::{InstanceState, Journal};
use crate::operation::{Operation, OperationName, OperationParameters, Range};
use crate::secrets::{Secret, Secrets};
use crate::store::SecretStore;

/// Default cap on operation reason length, in bytes.
pub const DEFAULT_MAX_REASON_LEN: usize = 1024;

/// Drives secret lifecycle operations against a journal and the configured
/// catalog.
#[derive(Debug, Clone)]
pub struct LifecycleController {
    journal: Journal,
    catalog: Secrets,
    max_reason_len: usize,
    token: CancellationToken,
}

impl LifecycleController {
    /// Creates a controller over `journal` for the loaded `catalog`.
    ///
    /// `token` is the ambient cancellation token: tripping it signals any
    /// running lifecycle script and fails the operation, with the failure
    /// still journalled.
    #[must_use]
    pub fn new(
        journal: Journal,
        catalog: Secrets,
        max_reason_len: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            journal,
            catalog,
            max_reason_len,
            token,
        }
    }

    /// Read-only access to the journal, for history queries and tooling.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Phase B and Phase C, detached from the caller.
    ///
    /// The work is spawned so a caller that goes away (a dropped request)
    /// cannot abort the script mid-run or lose the Phase C record; only the
    /// ambient token cancels scripts.
    async fn execute(
        &self,
        plan: Secret,
        operation: Operation,
        parameters: OperationParameters,
    ) -> Result<Instance> {
        let journal = self.journal.clone();
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            let name = operation.status.name;
            info!(
                secret = %operation.secret_id,
                instance = %operation.instance_id,
                operation = %name,
                forced = operation.status.forced,
                started_by = %operation.status.started_by,
                "operation started"
            );
            let result = plan
                .process(
                    name,
                    Vec::new(),
                    &parameters,
                    &operation.instance_id,
                    &token,
                )
                .await;

            let mut status = operation.status.clone();
            match result {
                Ok(()) => {
                    let completed_at = journal.with_tx(|tx| {
                        if name == OperationName::Deactivate {
                            Journal::clear_active(
                                tx,
                                &operation.secret_id,
                                &operation.instance_id,
                            )?;
                        }
                        Journal::complete_operation(tx, operation.id)
                    })?;
                    status.completed_at = Some(completed_at);
                    info!(
                        secret = %operation.secret_id,
                        instance = %operation.instance_id,
                        operation = %name,
                        "operation completed"
                    );
                    Ok(Instance {
                        id: operation.instance_id,
                        secret: plan,
                        status,
                    })
                }
                Err(err) => {
                    journal.with_tx(|tx| Journal::fail_operation(tx, operation.id))?;
                    error!(
                        secret = %operation.secret_id,
                        instance = %operation.instance_id,
                        operation = %name,
                        error = %err,
                        "operation failed"
                    );
                    Err(err)
                }
            }
        });
        handle
            .await
            .map_err(|e| Error::Journal(format!("operation task failed: {e}")))?
    }
}

/// Evaluates the admission table for a non-create operation.
///
/// Returns the guard message when the operation must be refused (or forced),
/// `None` when it is admitted outright.
fn admission_guard(
    name: OperationName,
    state: &InstanceState,
    instance_id: &str,
) -> Option<String> {
    let active = state.active_instance_id.as_deref();
    if state.last_completed_at.is_none() && name != state.last_name {
        return Some(format!(
            "{name} when previous {} has not succeeded",
            state.last_name
        ));
    }
    match name {
        OperationName::Activate => {
            if let Some(active) = active {
                return Some(format!("activate when instance {active} is active"));
            }
        }
        OperationName::Test | OperationName::Deactivate => {
            if active != Some(instance_id) {
                return Some(format!("{name} when instance is not active"));
            }
        }
        OperationName::Destroy => {
            if active == Some(instance_id) {
                return Some(format!("destroy when instance {instance_id} is active"));
            }
        }
        OperationName::Create => {}
    }
    None
}

#[async_trait]
impl SecretStore for LifecycleController {
    async fn list_secrets(&self) -> Result<Secrets> {
        Ok(self.catalog.clone())
    }

    async fn get_secret(&self, secret_id: &str) -> Result<Secret> {
        self.catalog
            .get(secret_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret plan does not exist {secret_id}")))
    }

    async fn secret_history(&self, secret_id: &str, range: Range) -> Result<Vec<Operation>> {
        self.journal.secret_history(secret_id, range)
    }

    async fn list_instances(&self, secret_id: &str, range: Range) -> Result<Instances> {
        self.journal.list_instances(secret_id, range)
    }

    async fn get_instance(&self, secret_id: &str, instance_id: &str) -> Result<Instance> {
        self.journal
            .get_instance(secret_id, instance_id)?
            .ok_or_else(|| {
                Error::NotFound(format!("secret instance does not exist {instance_id}"))
            })
    }

    async fn get_active(&self, secret_id: &str) -> Result<Option<Instance>> {
        self.journal.get_active(secret_id)
    }

    async fn create(&self, secret_id: &str, parameters: OperationParameters) -> Result<Instance> {
        parameters.validate(self.max_reason_len)?;
        let plan = self.get_secret(secret_id).await?;

        // Phase A: new secret row if absent, fresh instance with the plan
        // pinned, and the started operation, all in one transaction.
        let instance_id = Uuid::new_v4().to_string();
        let operation = self.journal.with_tx(|tx| {
            Journal::ensure_secret(tx, secret_id)?;
            Journal::insert_instance(tx, &instance_id, secret_id, &plan)?;
            Journal::start_operation(tx, secret_id, &instance_id, OperationName::Create, &parameters)
        })?;

        self.execute(plan, operation, parameters).await
    }

    async fn operate(
        &self,
        secret_id: &str,
        instance_id: &str,
        name: OperationName,
        parameters: OperationParameters,
    ) -> Result<Instance> {
        if name == OperationName::Create {
            return Err(Error::BadRequest("cannot post operation create".to_string()));
        }
        parameters.validate(self.max_reason_len)?;

        // Phase A: admission against current state, then the started row.
        // Reading and appending under one transaction serializes concurrent
        // attempts on the same instance: the loser observes the winner's
        // unfinished operation and is refused.
        let (plan, operation) = self.journal.with_tx(|tx| {
            let state = Journal::instance_state(tx, secret_id, instance_id)?.ok_or_else(|| {
                Error::NotFound(format!("secret instance does not exist {instance_id}"))
            })?;

            if let Some(guard) = admission_guard(name, &state, instance_id) {
                if parameters.forced {
                    warn!(
                        secret = %secret_id,
                        instance = %instance_id,
                        "forcing {guard}"
                    );
                } else {
                    return Err(Error::OperationRefused(guard));
                }
            }

            let operation =
                Journal::start_operation(tx, secret_id, instance_id, name, &parameters)?;
            if name == OperationName::Activate {
                Journal::set_active(tx, secret_id, instance_id)?;
            }
            Ok((state.plan, operation))
        })?;

        self.execute(plan, operation, parameters).await
    }

    async fn instance_history(
        &self,
        secret_id: &str,
        instance_id: &str,
        range: Range,
    ) -> Result<Vec<Operation>> {
        self.journal.instance_history(secret_id, instance_id, range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(catalog_json: &str) -> LifecycleController {
        let catalog: Secrets = serde_json::from_str(catalog_json).unwrap();
        LifecycleController::new(
            Journal::in_memory().unwrap(),
            catalog,
            DEFAULT_MAX_REASON_LEN,
            CancellationToken::new(),
        )
    }

    fn params() -> OperationParameters {
        OperationParameters {
            reason: "r".to_string(),
            started_by: "linux:test/1000".to_string(),
            ..OperationParameters::default()
        }
    }

    fn forced() -> OperationParameters {
        OperationParameters {
            forced: true,
            ..params()
        }
    }

    #[tokio::test]
    async fn create_records_a_completed_operation() {
        let c = controller(r#"[{"id":"friend","create":"echo hi"}]"#);
        let instance = c.create("friend", params()).await.unwrap();

        assert!(!instance.id.is_empty());
        assert_eq!(instance.status.name, OperationName::Create);
        assert!(instance.status.completed_at.is_some());
        assert!(instance.status.failed_at.is_none());
        assert_eq!(instance.status.started_by, "linux:test/1000");

        let listed = c.list_instances("friend", Range::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed.iter().next().unwrap().id, instance.id);
    }

    #[tokio::test]
    async fn create_of_unknown_secret_is_not_found() {
        let c = controller(r#"[{"id":"friend"}]"#);
        let err = c.create("stranger", params()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err:?}");
    }

    #[tokio::test]
    async fn failed_create_commits_the_failure_timestamp() {
        let c = controller(r#"[{"id":"broken","create":"exit 1"}]"#);
        let err = c.create("broken", params()).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }), "{err:?}");

        let listed = c.list_instances("broken", Range::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        let status = &listed.iter().next().unwrap().status;
        assert!(status.failed_at.is_some());
        assert!(status.completed_at.is_none());
    }

    #[tokio::test]
    async fn activate_sets_the_pointer_and_deactivate_clears_it() {
        let c = controller(r#"[{"id":"s","create":"true","activate":"true","deactivate":"true"}]"#);
        let instance = c.create("s", params()).await.unwrap();

        let activated = c
            .operate("s", &instance.id, OperationName::Activate, params())
            .await
            .unwrap();
        assert!(activated.status.completed_at.is_some());
        assert_eq!(
            c.journal().active_instance_id("s").unwrap().as_deref(),
            Some(instance.id.as_str())
        );
        let active = c.get_active("s").await.unwrap().unwrap();
        assert_eq!(active.id, instance.id);

        c.operate("s", &instance.id, OperationName::Deactivate, params())
            .await
            .unwrap();
        assert_eq!(c.journal().active_instance_id("s").unwrap(), None);
        assert!(c.get_active("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_activate_is_refused_then_forced_through() {
        let c = controller(r#"[{"id":"s","create":"true","activate":"true"}]"#);
        let first = c.create("s", params()).await.unwrap();
        c.operate("s", &first.id, OperationName::Activate, params())
            .await
            .unwrap();
        let second = c.create("s", params()).await.unwrap();

        let err = c
            .operate("s", &second.id, OperationName::Activate, params())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("cannot activate when instance {} is active", first.id)
        );
        assert_eq!(err.status(), 400);

        let activated = c
            .operate("s", &second.id, OperationName::Activate, forced())
            .await
            .unwrap();
        assert!(activated.status.forced);
        assert_eq!(
            c.journal().active_instance_id("s").unwrap().as_deref(),
            Some(second.id.as_str())
        );
    }

    #[tokio::test]
    async fn test_requires_the_active_instance() {
        let c = controller(r#"[{"id":"s","create":"true","activate":"true","test":"true"}]"#);
        let instance = c.create("s", params()).await.unwrap();

        let err = c
            .operate("s", &instance.id, OperationName::Test, params())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot test when instance is not active");

        c.operate("s", &instance.id, OperationName::Activate, params())
            .await
            .unwrap();
        c.operate("s", &instance.id, OperationName::Test, params())
            .await
            .unwrap();
        // A successful test leaves the instance active.
        assert_eq!(
            c.journal().active_instance_id("s").unwrap().as_deref(),
            Some(instance.id.as_str())
        );
    }

    #[tokio::test]
    async fn destroy_of_the_active_instance_needs_force() {
        let c = controller(
            r#"[{"id":"s","create":"true","activate":"true","destroy":"true"}]"#,
        );
        let instance = c.create("s", params()).await.unwrap();
        c.operate("s", &instance.id, OperationName::Activate, params())
            .await
            .unwrap();

        let err = c
            .operate("s", &instance.id, OperationName::Destroy, params())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OperationRefused(_)), "{err:?}");

        c.operate("s", &instance.id, OperationName::Destroy, forced())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unfinished_operation_blocks_other_operations() {
        let c = controller(r#"[{"id":"s","create":"exit 1","activate":"true"}]"#);
        let err = c.create("s", params()).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        let listed = c.list_instances("s", Range::default()).await.unwrap();
        let instance_id = listed.iter().next().unwrap().id.clone();

        // The failed create has no completed_at: a different operation is
        // refused, an idempotent retry of the same name is admitted.
        let err = c
            .operate("s", &instance_id, OperationName::Activate, params())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot activate when previous create has not succeeded"
        );

        let activated = c
            .operate("s", &instance_id, OperationName::Activate, forced())
            .await
            .unwrap();
        assert!(activated.status.forced);
        assert!(activated.status.completed_at.is_some());
    }

    #[tokio::test]
    async fn idempotent_retry_of_the_same_operation_is_admitted() {
        let c = controller(
            r#"[{"id":"s","create":"true","activate":"true","deactivate":"exit 1"}]"#,
        );
        let instance = c.create("s", params()).await.unwrap();
        c.operate("s", &instance.id, OperationName::Activate, params())
            .await
            .unwrap();
        let _ = c
            .operate("s", &instance.id, OperationName::Deactivate, params())
            .await
            .unwrap_err();
        // The failed deactivate left the pointer in place, so a retry of
        // the same name is admitted without force and fails on the script
        // again, not on admission.
        let err = c
            .operate("s", &instance.id, OperationName::Deactivate, params())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn failed_activate_leaves_the_pointer_set() {
        let c = controller(r#"[{"id":"s","create":"true","activate":"exit 1"}]"#);
        let instance = c.create("s", params()).await.unwrap();
        let err = c
            .operate("s", &instance.id, OperationName::Activate, params())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }), "{err:?}");
        // Pessimistically set in Phase A and deliberately not cleared: the
        // instance is possibly active and must surface for cleanup.
        assert_eq!(
            c.journal().active_instance_id("s").unwrap().as_deref(),
            Some(instance.id.as_str())
        );
    }

    #[tokio::test]
    async fn operations_run_the_pinned_plan_not_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("ran");
        let c = controller(&format!(
            r#"[{{"id":"s","create":"true","destroy":"echo pinned > {out}"}}]"#,
            out = out.display()
        ));
        let instance = c.create("s", params()).await.unwrap();

        // A controller over the same journal with an edited catalog: the
        // destroy run must still use the plan captured at create time.
        let edited: Secrets =
            serde_json::from_str(r#"[{"id":"s","create":"true","destroy":"exit 9"}]"#).unwrap();
        let c2 = LifecycleController::new(
            c.journal().clone(),
            edited,
            DEFAULT_MAX_REASON_LEN,
            CancellationToken::new(),
        );
        c2.operate("s", &instance.id, OperationName::Destroy, params())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "pinned\n");
    }

    #[tokio::test]
    async fn reason_guard_fires_before_any_journal_work() {
        let c = controller(r#"[{"id":"s","create":"true"}]"#);
        let long = OperationParameters {
            reason: "x".repeat(DEFAULT_MAX_REASON_LEN + 1),
            ..params()
        };
        let err = c.create("s", long).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)), "{err:?}");
        assert!(c
            .list_instances("s", Range::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn refused_operation_records_no_row() {
        let c = controller(r#"[{"id":"s","create":"true","test":"true"}]"#);
        let instance = c.create("s", params()).await.unwrap();
        let before = c
            .instance_history("s", &instance.id, Range::default())
            .await
            .unwrap()
            .len();
        let _ = c
            .operate("s", &instance.id, OperationName::Test, params())
            .await
            .unwrap_err();
        let after = c
            .instance_history("s", &instance.id, Range::default())
            .await
            .unwrap()
            .len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn forced_operation_is_recorded_as_forced() {
        let c = controller(r#"[{"id":"s","create":"true","test":"true"}]"#);
        let instance = c.create("s", params()).await.unwrap();
        c.operate("s", &instance.id, OperationName::Test, forced())
            .await
            .unwrap();
        let history = c
            .instance_history("s", &instance.id, Range::default())
            .await
            .unwrap();
        assert_eq!(history[0].status.name, OperationName::Test);
        assert!(history[0].status.forced);
    }

    #[tokio::test]
    async fn at_most_one_active_instance_per_secret() {
        let c = controller(r#"[{"id":"s","create":"true","activate":"true"}]"#);
        let a = c.create("s", params()).await.unwrap();
        c.operate("s", &a.id, OperationName::Activate, params())
            .await
            .unwrap();
        let b = c.create("s", params()).await.unwrap();
        c.operate("s", &b.id, OperationName::Activate, forced())
            .await
            .unwrap();
        // The pointer is single-valued by construction; the previously
        // active instance is no longer reported active.
        assert_eq!(
            c.journal().active_instance_id("s").unwrap().as_deref(),
            Some(b.id.as_str())
        );
        let active = c.get_active("s").await.unwrap().unwrap();
        assert_eq!(active.id, b.id);
    }

    #[tokio::test]
    async fn posting_create_as_an_operation_is_rejected() {
        let c = controller(r#"[{"id":"s","create":"true"}]"#);
        let instance = c.create("s", params()).await.unwrap();
        let err = c
            .operate("s", &instance.id, OperationName::Create, params())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)), "{err:?}");
    }

    #[tokio::test]
    async fn operate_on_unknown_instance_is_not_found() {
        let c = controller(r#"[{"id":"s","create":"true"}]"#);
        c.create("s", params()).await.unwrap();
        let err = c
            .operate("s", "no-such-instance", OperationName::Destroy, params())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_operations_on_one_instance_serialize() {
        let c = controller(
            r#"[{"id":"s","environment":{"PATH":"/usr/bin:/bin"},
                 "create":"true","activate":"true","test":"sleep 0.4","destroy":"true"}]"#,
        );
        let instance = c.create("s", params()).await.unwrap();
        c.operate("s", &instance.id, OperationName::Activate, params())
            .await
            .unwrap();

        // First request starts a slow test; once its Phase A has committed,
        // a different operation observes the in-flight row and is refused.
        let slow = {
            let c = c.clone();
            let id = instance.id.clone();
            tokio::spawn(
                async move { c.operate("s", &id, OperationName::Test, params()).await },
            )
        };
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        let err = c
            .operate("s", &instance.id, OperationName::Destroy, params())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot destroy when previous test has not succeeded"
        );

        let tested = slow.await.unwrap().unwrap();
        assert!(tested.status.completed_at.is_some());
    }

    #[tokio::test]
    async fn instance_listing_is_newest_first() {
        let c = controller(r#"[{"id":"s","create":"true","test":"true","activate":"true"}]"#);
        let first = c.create("s", params()).await.unwrap();
        let second = c.create("s", params()).await.unwrap();
        // Touch the first instance so its latest operation is newest.
        c.operate("s", &first.id, OperationName::Activate, params())
            .await
            .unwrap();

        let listed = c.list_instances("s", Range::default()).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, [first.id.as_str(), second.id.as_str()]);
    }
}

//! The converge state machine.
//!
//! One call: build desired -> parent lifecycle check -> fetch -> create | delete on immutable
//! drift | diff and update | no-op. Every store call is attempted once; retrying is the caller's
//! business (it re-invokes converge on the next reconcile).

use std::fmt;
use std::time::Instant;

use keel_core::config::{env_flag, ENV_REPAIR_OWNER_REFS, ENV_TOLERATE_MUTATION_ERRORS};
use keel_core::{ConvergeState, FailureReason, ObjectKey, Operation, Outcome};
use keel_store::{ParentLifecycle, StoreClient, StoreError};
use kube::Resource;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::compare::ComparatorTable;
use crate::mutation::MutationError;
use crate::owner;
use crate::request::{Built, ResourceRequest};

/// What to do when mutation hooks fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationPolicy {
    /// Abort the call with `ConvergeError::Mutation`.
    #[default]
    Fatal,
    /// Log and converge the partially mutated object.
    Tolerate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConvergeOptions {
    pub mutation_policy: MutationPolicy,
    /// Re-assert the owner link on existing children that lack it.
    pub repair_owner_refs: bool,
}

impl ConvergeOptions {
    pub fn from_env() -> Self {
        Self {
            mutation_policy: if env_flag(ENV_TOLERATE_MUTATION_ERRORS) {
                MutationPolicy::Tolerate
            } else {
                MutationPolicy::Fatal
            },
            repair_owner_refs: env_flag(ENV_REPAIR_OWNER_REFS),
        }
    }
}

type ImmutableCheck<K> = dyn Fn(&K, &K) -> bool + Send + Sync;

/// Per-kind drift rules: the comparator table plus an optional predicate that reports
/// incompatible (immutable-field) drift between existing and desired.
pub struct DriftPolicy<K> {
    pub fields: ComparatorTable<K>,
    pub immutable: Option<Box<ImmutableCheck<K>>>,
}

impl<K> DriftPolicy<K> {
    pub fn new(fields: ComparatorTable<K>) -> Self { Self { fields, immutable: None } }

    pub fn with_immutable<F>(mut self, check: F) -> Self
    where
        F: Fn(&K, &K) -> bool + Send + Sync + 'static,
    {
        self.immutable = Some(Box::new(check));
        self
    }

    pub fn is_immutable_drift(&self, existing: &K, desired: &K) -> bool {
        self.immutable.as_ref().map_or(false, |check| check(existing, desired))
    }
}

impl<K> fmt::Debug for DriftPolicy<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriftPolicy")
            .field("fields", &self.fields)
            .field("immutable", &self.immutable.is_some())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConvergeError {
    #[error("build {key}: {source}")]
    Mutation { key: ObjectKey, source: MutationError },
    #[error("{op} {key}: {source}")]
    Store { op: Operation, key: ObjectKey, source: StoreError },
}

impl ConvergeError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ConvergeError::Mutation { .. } => FailureReason::Mutation,
            ConvergeError::Store { op, .. } => FailureReason::Store(*op),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        match self {
            ConvergeError::Mutation { key, .. } | ConvergeError::Store { key, .. } => key,
        }
    }

    fn store(op: Operation, key: &ObjectKey, source: StoreError) -> Self {
        ConvergeError::Store { op, key: key.clone(), source }
    }
}

/// Converges child objects through a store, consulting a parent lifecycle.
pub struct Converger<S, L> {
    store: S,
    lifecycle: L,
    options: ConvergeOptions,
}

impl<S, L> Converger<S, L>
where
    L: ParentLifecycle,
{
    pub fn new(store: S, lifecycle: L) -> Self { Self { store, lifecycle, options: ConvergeOptions::default() } }

    pub fn with_options(mut self, options: ConvergeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> ConvergeOptions { self.options }

    pub fn store(&self) -> &S { &self.store }

    /// Drive the child described by `request` toward its desired state.
    pub async fn converge<K, C>(
        &self,
        request: ResourceRequest<K, C>,
        policy: &DriftPolicy<K>,
    ) -> Result<Outcome, ConvergeError>
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
        S: StoreClient<K>,
    {
        let kind = K::kind(&()).to_string();
        let key = request.key();
        let t0 = Instant::now();
        let res = self.run(&kind, &key, request, policy).await;
        histogram!("converge_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.clone());
        record(&kind, &key, &res);
        res
    }

    /// Remove a child outright. A child that is already gone counts as deleted.
    pub async fn delete<K>(&self, key: &ObjectKey) -> Result<Outcome, ConvergeError>
    where
        K: Resource<DynamicType = ()> + Send + Sync + 'static,
        S: StoreClient<K>,
    {
        let kind = K::kind(&()).to_string();
        let res = self.remove::<K>(key).await;
        record(&kind, key, &res);
        res
    }

    async fn run<K, C>(
        &self,
        kind: &str,
        key: &ObjectKey,
        request: ResourceRequest<K, C>,
        policy: &DriftPolicy<K>,
    ) -> Result<Outcome, ConvergeError>
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
        S: StoreClient<K>,
    {
        let Built { object: desired, error } = request.build();
        if let Some(err) = error {
            match self.options.mutation_policy {
                MutationPolicy::Fatal => return Err(ConvergeError::Mutation { key: key.clone(), source: err }),
                MutationPolicy::Tolerate => {
                    warn!(kind, object = %key, error = %err, "mutation hooks failed; converging partial object")
                }
            }
        }

        let terminating = self
            .lifecycle
            .is_terminating(&request.parent)
            .await
            .map_err(|e| ConvergeError::store(Operation::Lifecycle, key, e))?;
        if terminating {
            debug!(kind, object = %key, state = %ConvergeState::ParentTerminating, "parent is going away");
            return self.remove::<K>(key).await;
        }

        let mut existing = match self.store.get(key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                debug!(kind, object = %key, state = %ConvergeState::Absent, "creating");
                let mut obj = desired;
                if let Err(e) = owner::attach(&mut obj, &request.parent) {
                    counter!("owner_link_failed_total", 1u64, "kind" => kind.to_string());
                    warn!(kind, object = %key, error = %e, "owner reference not set");
                }
                self.store.create(&obj).await.map_err(|e| ConvergeError::store(Operation::Create, key, e))?;
                return Ok(Outcome::Created);
            }
            Err(e) => return Err(ConvergeError::store(Operation::Get, key, e)),
        };

        if policy.is_immutable_drift(&existing, &desired) {
            // recreated by the next converge call once the delete has gone through
            debug!(kind, object = %key, state = %ConvergeState::PresentImmutableDrift, "deleting");
            return self.remove::<K>(key).await;
        }

        let changed = policy.fields.changed_fields(&mut existing, &desired);
        let mut drift = !changed.is_empty();
        if self.options.repair_owner_refs && !owner::is_owned_by(&existing, &request.parent) {
            match owner::attach(&mut existing, &request.parent) {
                Ok(()) => drift = true,
                Err(e) => {
                    counter!("owner_link_failed_total", 1u64, "kind" => kind.to_string());
                    debug!(kind, object = %key, error = %e, "owner reference not repaired");
                }
            }
        }
        if !drift {
            debug!(kind, object = %key, state = %ConvergeState::PresentNoDrift, "in sync");
            return Ok(Outcome::NoOp);
        }
        debug!(kind, object = %key, state = %ConvergeState::PresentDrift, fields = ?changed, "updating");
        self.store.update(&existing).await.map_err(|e| ConvergeError::store(Operation::Update, key, e))?;
        Ok(Outcome::Updated)
    }

    async fn remove<K>(&self, key: &ObjectKey) -> Result<Outcome, ConvergeError>
    where
        K: Send + Sync + 'static,
        S: StoreClient<K>,
    {
        match self.store.delete(key).await {
            Ok(()) => Ok(Outcome::Deleted),
            Err(e) if e.is_not_found() => Ok(Outcome::Deleted),
            Err(e) => Err(ConvergeError::store(Operation::Delete, key, e)),
        }
    }
}

fn record(kind: &str, key: &ObjectKey, res: &Result<Outcome, ConvergeError>) {
    match res {
        Ok(outcome) => {
            counter!("converge_outcome_total", 1u64, "kind" => kind.to_string(), "outcome" => outcome.as_str());
            match outcome {
                Outcome::NoOp => debug!(kind, object = %key, outcome = %outcome, "converged"),
                _ => info!(kind, object = %key, outcome = %outcome, "converged"),
            }
        }
        Err(e) => {
            counter!("converge_failed_total", 1u64, "kind" => kind.to_string(), "reason" => e.reason().as_str());
            warn!(kind, object = %key, reason = %e.reason(), error = %e, "converge failed");
        }
    }
}

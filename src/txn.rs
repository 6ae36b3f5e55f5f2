//! Atomic multi-ref transactions, optionally spanning a secondary repository.
//!
//! A [`RefTransaction`] stages ref commands against a primary repository and
//! (optionally) a secondary one holding per-user advisory refs. Execution
//! applies the primary batch atomically through
//! [`RefStore::compare_and_swap_batch`]; only once the primary has fully
//! succeeded are secondary commands applied, one by one. A secondary failure
//! is logged and reported, never rolled back; the primary is the record of
//! truth and advisory refs may lag.
//!
//! Commands are validated as they are added: one command per ref (except
//! rewrites, which chain tip to tip in insertion order), and secondary
//! commands require a secondary repository. Execution is
//! single-shot; a transaction cannot be re-run after [`execute`] returns,
//! successfully or not.
//!
//! [`execute`]: RefTransaction::execute

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::{LockFailure, StorageError, TransactionError};
use crate::id::ObjectId;
use crate::refs::{self, RefName};
use crate::store::{RefUpdate, RefUpdateOutcome, Repository};

/// Computes a replacement tip for one ref, given its current tip.
///
/// Rewriters run at execution time so they see the ref as it is at the
/// moment of the transaction, and the resulting update carries that observed
/// tip as its expected-old value. Returning `None` leaves the tip unchanged;
/// a rewrite whose whole chain ends back at the observed tip stages nothing.
pub trait HistoryRewriter {
    fn ref_name(&self) -> RefName;

    fn rewrite(
        &self,
        repo: &dyn Repository,
        tip: ObjectId,
    ) -> Result<Option<ObjectId>, TransactionError>;
}

enum RefOp {
    Update {
        expected_old: Option<ObjectId>,
        new: ObjectId,
    },
    Delete {
        expected_old: Option<ObjectId>,
    },
    Rewrite(Vec<Box<dyn HistoryRewriter>>),
}

impl RefOp {
    fn kind(&self) -> &'static str {
        match self {
            RefOp::Update { .. } => "update",
            RefOp::Delete { .. } => "delete",
            RefOp::Rewrite(_) => "rewrite",
        }
    }
}

fn stage(ops: &mut BTreeMap<RefName, RefOp>, name: RefName, op: RefOp) -> Result<(), TransactionError> {
    match (ops.get_mut(&name), op) {
        (None, op) => {
            ops.insert(name, op);
            Ok(())
        }
        // Rewrites compose; each one sees the tip the previous produced.
        (Some(RefOp::Rewrite(chain)), RefOp::Rewrite(mut more)) => {
            chain.append(&mut more);
            Ok(())
        }
        (Some(existing), op) => Err(TransactionError::InvalidInput(format!(
            "ref {name} already staged as {}, cannot also stage {}",
            existing.kind(),
            op.kind()
        ))),
    }
}

/// Names of refs touched (or skipped) by a completed transaction.
#[derive(Debug, Default)]
pub struct TransactionResult {
    /// Primary refs updated, in name order.
    pub applied: Vec<RefName>,
    /// Secondary refs updated.
    pub secondary_applied: Vec<RefName>,
    /// Secondary refs whose update failed and was tolerated.
    pub secondary_failures: Vec<RefName>,
}

/// A staged, single-shot batch of ref commands.
pub struct RefTransaction<'a> {
    primary: &'a dyn Repository,
    secondary: Option<&'a dyn Repository>,
    config: CoreConfig,
    primary_ops: BTreeMap<RefName, RefOp>,
    secondary_ops: BTreeMap<RefName, RefOp>,
    executed: bool,
}

impl<'a> RefTransaction<'a> {
    pub fn new(primary: &'a dyn Repository) -> Self {
        RefTransaction {
            primary,
            secondary: None,
            config: CoreConfig::default(),
            primary_ops: BTreeMap::new(),
            secondary_ops: BTreeMap::new(),
            executed: false,
        }
    }

    pub fn with_secondary(mut self, secondary: &'a dyn Repository) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.primary_ops.is_empty() && self.secondary_ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.primary_ops.len() + self.secondary_ops.len()
    }

    /// Stages a primary ref update with CAS semantics.
    pub fn add_update(
        &mut self,
        name: RefName,
        expected_old: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<(), TransactionError> {
        self.stage_primary(name, RefOp::Update { expected_old, new })
    }

    /// Stages a primary ref deletion.
    pub fn add_delete(
        &mut self,
        name: RefName,
        expected_old: Option<ObjectId>,
    ) -> Result<(), TransactionError> {
        self.stage_primary(name, RefOp::Delete { expected_old })
    }

    /// Stages a primary history rewrite, resolved at execution time.
    /// Several rewrites of the same ref chain in insertion order.
    pub fn add_rewrite(
        &mut self,
        rewriter: Box<dyn HistoryRewriter>,
    ) -> Result<(), TransactionError> {
        self.stage_primary(rewriter.ref_name(), RefOp::Rewrite(vec![rewriter]))
    }

    pub fn add_secondary_update(
        &mut self,
        name: RefName,
        expected_old: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<(), TransactionError> {
        self.stage_secondary(name, RefOp::Update { expected_old, new })
    }

    pub fn add_secondary_delete(
        &mut self,
        name: RefName,
        expected_old: Option<ObjectId>,
    ) -> Result<(), TransactionError> {
        self.stage_secondary(name, RefOp::Delete { expected_old })
    }

    pub fn add_secondary_rewrite(
        &mut self,
        rewriter: Box<dyn HistoryRewriter>,
    ) -> Result<(), TransactionError> {
        self.stage_secondary(rewriter.ref_name(), RefOp::Rewrite(vec![rewriter]))
    }

    fn stage_primary(&mut self, name: RefName, op: RefOp) -> Result<(), TransactionError> {
        if self.executed {
            return Err(TransactionError::AlreadyExecuted);
        }
        stage(&mut self.primary_ops, name, op)
    }

    fn stage_secondary(&mut self, name: RefName, op: RefOp) -> Result<(), TransactionError> {
        if self.executed {
            return Err(TransactionError::AlreadyExecuted);
        }
        if self.secondary.is_none() {
            return Err(TransactionError::InvalidInput(format!(
                "no secondary repository for {name}"
            )));
        }
        stage(&mut self.secondary_ops, name, op)
    }

    /// Runs the transaction.
    ///
    /// An empty transaction succeeds without touching either repository.
    /// A primary CAS failure aborts the whole transaction with nothing
    /// applied; secondary failures are tolerated and reported.
    pub fn execute(&mut self) -> Result<TransactionResult, TransactionError> {
        if self.executed {
            return Err(TransactionError::AlreadyExecuted);
        }
        self.executed = true;

        if self.is_empty() {
            return Ok(TransactionResult::default());
        }
        if self.len() > self.config.max_updates {
            return Err(TransactionError::InvalidInput(format!(
                "{} ref commands staged, limit is {}",
                self.len(),
                self.config.max_updates
            )));
        }

        let mut result = TransactionResult::default();

        let mut batch = Vec::with_capacity(self.primary_ops.len());
        for (name, op) in &self.primary_ops {
            if let Some(update) = materialize(self.primary, name, op)? {
                batch.push(update);
            }
        }
        let outcomes = self.primary.compare_and_swap_batch(&batch)?;
        for (update, outcome) in batch.iter().zip(&outcomes) {
            match outcome {
                RefUpdateOutcome::LockFailure { expected, actual } => {
                    return Err(LockFailure {
                        name: update.name.clone(),
                        expected: *expected,
                        actual: *actual,
                    }
                    .into());
                }
                RefUpdateOutcome::RejectedNonFastForward => {
                    return Err(TransactionError::Rejected(update.name.clone()));
                }
                _ => result.applied.push(update.name.clone()),
            }
        }
        debug!(refs = result.applied.len(), "primary batch applied");

        if let Some(secondary) = self.secondary {
            for (name, op) in &self.secondary_ops {
                let update = match materialize(secondary, name, op) {
                    Ok(Some(update)) => update,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(ref_name = %name, error = %err, "secondary command failed");
                        result.secondary_failures.push(name.clone());
                        continue;
                    }
                };
                match secondary.compare_and_swap(&update) {
                    Ok(outcome) if outcome.is_applied() => {
                        result.secondary_applied.push(name.clone());
                    }
                    Ok(outcome) => {
                        warn!(ref_name = %name, ?outcome, "secondary update not applied");
                        result.secondary_failures.push(name.clone());
                    }
                    Err(err) => {
                        warn!(ref_name = %name, error = %err, "secondary update failed");
                        result.secondary_failures.push(name.clone());
                    }
                }
            }
        }

        info!(
            primary = result.applied.len(),
            secondary = result.secondary_applied.len(),
            tolerated = result.secondary_failures.len(),
            "transaction executed"
        );
        Ok(result)
    }
}

/// Turns a staged command into a concrete CAS, resolving rewrites against
/// the repository's current state. `force` is granted only where history is
/// not required to be preserved: single-object refs, deletions, rewrites.
fn materialize(
    repo: &dyn Repository,
    name: &RefName,
    op: &RefOp,
) -> Result<Option<RefUpdate>, TransactionError> {
    match op {
        RefOp::Update { expected_old, new } => Ok(Some(RefUpdate {
            name: name.clone(),
            expected_old: *expected_old,
            new: Some(*new),
            force: refs::is_single_object(name),
        })),
        RefOp::Delete { expected_old } => Ok(Some(RefUpdate {
            name: name.clone(),
            expected_old: *expected_old,
            new: None,
            force: true,
        })),
        RefOp::Rewrite(chain) => {
            let tip = repo
                .resolve(name)?
                .ok_or_else(|| StorageError::EmptyRef(name.clone()))?;
            let mut current = tip;
            for rewriter in chain {
                if let Some(next) = rewriter.rewrite(repo, current)? {
                    current = next;
                }
            }
            if current == tip {
                return Ok(None);
            }
            Ok(Some(RefUpdate {
                name: name.clone(),
                expected_old: Some(tip),
                new: Some(current),
                force: true,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryRepository;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 32])
    }

    #[test]
    fn duplicate_commands_are_rejected_at_add_time() {
        let repo = MemoryRepository::new();
        let mut txn = RefTransaction::new(&repo);
        let name = RefName::from("refs/changes/01/1/meta");
        txn.add_update(name.clone(), None, oid(1)).unwrap();
        let err = txn.add_delete(name, None).unwrap_err();
        assert!(matches!(err, TransactionError::InvalidInput(_)));
    }

    #[test]
    fn secondary_commands_require_a_secondary_repository() {
        let repo = MemoryRepository::new();
        let mut txn = RefTransaction::new(&repo);
        let err = txn
            .add_secondary_update(RefName::from("refs/draft-comments/01/1/u"), None, oid(1))
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidInput(_)));
    }

    #[test]
    fn command_limit_is_checked_before_any_io() {
        let repo = MemoryRepository::new();
        let mut txn = RefTransaction::new(&repo).with_config(CoreConfig {
            max_updates: 1,
            ..CoreConfig::default()
        });
        // Neither object exists, but the limit must trip first.
        txn.add_update(RefName::from("refs/changes/01/1/meta"), None, oid(1))
            .unwrap();
        txn.add_update(RefName::from("refs/changes/02/2/meta"), None, oid(2))
            .unwrap();
        let err = txn.execute().unwrap_err();
        assert!(matches!(err, TransactionError::InvalidInput(_)));
    }
}

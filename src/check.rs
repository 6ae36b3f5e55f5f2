//! Consistency checking and repair for change records.
//!
//! A check run walks one change's stored invariants in stages: the owner
//! account, the current patch set entry, every patch set's ref and commit,
//! and finally the merged/open status against the destination branch. Each
//! finding becomes a [`Problem`] value; the run itself only fails on fatal
//! storage errors.
//!
//! Repairs are opt-in (a [`FixInput`] is supplied) and go through the same
//! write paths as ordinary mutations: record fixes are committed onto the
//! meta ref, ref fixes ride a [`RefTransaction`], and each fix marks its
//! problem [`ProblemStatus::Fixed`] or [`ProblemStatus::FixFailed`] with an
//! outcome message. A failed fix never aborts the remaining checks.

use std::collections::{BTreeMap, HashMap};

use tracing::{info, warn};

use crate::change::{Change, ChangeId, ChangeStatus, ChangeStrategy, PatchSet, PatchSetState};
use crate::config::CoreConfig;
use crate::error::{DocumentError, TransactionError};
use crate::id::ObjectId;
use crate::ident::IdentityProvider;
use crate::meta::MetadataDocument;
use crate::refs::{self, RefName};
use crate::store::Repository;
use crate::txn::RefTransaction;
use crate::walk;

/// Account lookups, supplied by the embedding server.
pub trait AccountDirectory {
    fn exists(&self, account: &str) -> bool;
}

/// Which repairs a check run is allowed to perform. Absence of a `FixInput`
/// makes the run read-only.
#[derive(Debug, Clone, Default)]
pub struct FixInput {
    /// Delete patch set entries whose commit object no longer exists.
    pub delete_patch_set_if_commit_missing: bool,
    /// The caller asserts this commit landed on the destination branch;
    /// reconcile the record with it.
    pub expect_merged_as: Option<ObjectId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemStatus {
    Fixed,
    FixFailed,
}

/// One finding, plus the outcome of its repair if one was attempted.
#[derive(Debug, Clone)]
pub struct Problem {
    pub message: String,
    pub fixable: bool,
    pub status: Option<ProblemStatus>,
    pub outcome: Option<String>,
}

impl Problem {
    fn new(message: String, fixable: bool) -> Self {
        Problem {
            message,
            fixable,
            status: None,
            outcome: None,
        }
    }
}

/// All findings for one change.
#[derive(Debug, Default)]
pub struct CheckResult {
    pub problems: Vec<Problem>,
}

impl CheckResult {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Outcome of a bulk run over many changes.
#[derive(Debug, Default)]
pub struct BulkCheckOutcome {
    pub results: BTreeMap<ChangeId, CheckResult>,
    /// Changes whose check aborted with a storage error.
    pub failures: Vec<(ChangeId, String)>,
    /// False when the failure fraction exceeded the configured threshold;
    /// the run's findings should then not drive automated decisions.
    pub trustworthy: bool,
}

/// Validates and optionally repairs change records.
pub struct ConsistencyChecker<'a> {
    repo: &'a dyn Repository,
    accounts: &'a dyn AccountDirectory,
    identity: &'a dyn IdentityProvider,
    config: CoreConfig,
}

impl<'a> ConsistencyChecker<'a> {
    pub fn new(
        repo: &'a dyn Repository,
        accounts: &'a dyn AccountDirectory,
        identity: &'a dyn IdentityProvider,
    ) -> Self {
        ConsistencyChecker {
            repo,
            accounts,
            identity,
            config: CoreConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Checks one change, applying the repairs `fix` permits.
    pub fn check(
        &self,
        id: ChangeId,
        fix: Option<&FixInput>,
    ) -> Result<CheckResult, DocumentError> {
        let mut run = CheckRun {
            repo: self.repo,
            accounts: self.accounts,
            identity: self.identity,
            config: &self.config,
            id,
            fix,
            problems: Vec::new(),
        };
        run.execute()?;
        Ok(CheckResult {
            problems: run.problems,
        })
    }

    /// Checks many changes independently. A change whose check aborts is
    /// recorded as a failure and the run continues; too many failures mark
    /// the whole outcome untrustworthy.
    pub fn check_all(&self, ids: &[ChangeId], fix: Option<&FixInput>) -> BulkCheckOutcome {
        let mut outcome = BulkCheckOutcome {
            trustworthy: true,
            ..BulkCheckOutcome::default()
        };
        for &id in ids {
            match self.check(id, fix) {
                Ok(result) => {
                    outcome.results.insert(id, result);
                }
                Err(err) => {
                    warn!(change = %id, error = %err, "consistency check aborted");
                    outcome.failures.push((id, err.to_string()));
                }
            }
        }
        if !ids.is_empty() {
            let failure_fraction = outcome.failures.len() as f64 / ids.len() as f64;
            outcome.trustworthy = failure_fraction <= self.config.bulk_failure_threshold;
        }
        info!(
            checked = outcome.results.len(),
            failed = outcome.failures.len(),
            trustworthy = outcome.trustworthy,
            "bulk consistency check finished"
        );
        outcome
    }
}

struct CheckRun<'a> {
    repo: &'a dyn Repository,
    accounts: &'a dyn AccountDirectory,
    identity: &'a dyn IdentityProvider,
    config: &'a CoreConfig,
    id: ChangeId,
    fix: Option<&'a FixInput>,
    problems: Vec<Problem>,
}

impl CheckRun<'_> {
    fn problem(&mut self, message: String) -> usize {
        self.problems.push(Problem::new(message, false));
        self.problems.len() - 1
    }

    fn fixable_problem(&mut self, message: String) -> usize {
        self.problems.push(Problem::new(message, true));
        self.problems.len() - 1
    }

    fn fixed(&mut self, idx: usize, outcome: String) {
        self.problems[idx].status = Some(ProblemStatus::Fixed);
        self.problems[idx].outcome = Some(outcome);
    }

    fn fix_failed(&mut self, idx: usize, outcome: String) {
        self.problems[idx].status = Some(ProblemStatus::FixFailed);
        self.problems[idx].outcome = Some(outcome);
    }

    fn fixing(&self) -> bool {
        self.fix.is_some()
    }

    fn execute(&mut self) -> Result<(), DocumentError> {
        let meta_ref = refs::change_meta(self.id);
        let Some(tip) = self.repo.resolve(&meta_ref)? else {
            self.problem(format!("Change {} not found", self.id));
            return Ok(());
        };
        let mut doc = MetadataDocument::load_at(
            self.repo,
            ChangeStrategy::new(self.id),
            meta_ref,
            Some(tip),
        )?;

        self.check_owner(&doc.state().change);
        if !self.check_current_patch_set(&doc.state().change) {
            return Ok(());
        }
        // A stage failing fatally skips the remaining stages but keeps the
        // findings gathered so far; only a record that cannot be loaded at
        // all aborts the whole check.
        let staged = self
            .check_patch_sets(&mut doc)
            .and_then(|()| self.check_merged(&mut doc));
        if let Err(err) = staged {
            self.problem(format!("Check incomplete: {err}"));
        }
        Ok(())
    }

    fn check_owner(&mut self, change: &Change) {
        if change.owner.is_empty() || !self.accounts.exists(&change.owner) {
            self.problem(format!("Missing change owner: {}", change.owner));
        }
    }

    /// The current-patch-set pointer must name an existing entry; without it
    /// the per-patch-set checks have no anchor.
    fn check_current_patch_set(&mut self, change: &Change) -> bool {
        if change.current_patch_set().is_some() {
            true
        } else {
            self.problem(format!("Current patch set {} not found", change.current));
            false
        }
    }

    fn check_patch_sets(
        &mut self,
        doc: &mut MetadataDocument<ChangeStrategy>,
    ) -> Result<(), DocumentError> {
        let change = doc.state().change.clone();
        let mut by_commit: HashMap<ObjectId, Vec<u32>> = HashMap::new();
        let mut missing_commits: Vec<(u32, usize)> = Vec::new();

        let total = change.patch_sets.len() as u32;
        if total > self.config.max_patch_sets {
            self.problem(format!(
                "Change has {total} patch sets, limit is {}",
                self.config.max_patch_sets
            ));
        }

        // Newest first, so the report leads with the patch sets users are
        // actually looking at.
        for ps in change
            .patch_sets
            .values()
            .rev()
            .filter(|ps| ps.state == PatchSetState::Active)
        {
            by_commit.entry(ps.commit).or_default().push(ps.ordinal);

            if self.repo.try_commit(&ps.commit)?.is_none() {
                let fixable = self
                    .fix
                    .map_or(false, |f| f.delete_patch_set_if_commit_missing);
                let idx = if fixable {
                    self.fixable_problem(format!(
                        "Commit {} of patch set {} is missing",
                        ps.commit, ps.ordinal
                    ))
                } else {
                    self.problem(format!(
                        "Commit {} of patch set {} is missing",
                        ps.commit, ps.ordinal
                    ))
                };
                if fixable {
                    missing_commits.push((ps.ordinal, idx));
                }
                continue;
            }

            let name = refs::patch_set(self.id, ps.ordinal);
            match self.repo.resolve(&name)? {
                None => {
                    let idx = self.fixable_problem(format!("Ref missing: {name}"));
                    if self.fixing() {
                        self.repair_patch_set_ref(idx, name, None, ps.commit);
                    }
                }
                Some(actual) if actual != ps.commit => {
                    let idx = self.fixable_problem(format!(
                        "Expected {name} to point to {}, found {actual}",
                        ps.commit
                    ));
                    if self.fixing() {
                        self.repair_patch_set_ref(idx, name, Some(actual), ps.commit);
                    }
                }
                Some(_) => {}
            }
        }

        for (commit, ordinals) in by_commit {
            if ordinals.len() > 1 {
                let mut ordinals = ordinals;
                ordinals.sort_unstable();
                self.problem(format!(
                    "Multiple patch sets pointing to {commit}: {ordinals:?}"
                ));
            }
        }

        if !missing_commits.is_empty() {
            self.delete_patch_sets(doc, &change, missing_commits)?;
        }
        Ok(())
    }

    /// Patch set refs carry no history, so a wrong or missing one is
    /// repaired by a plain forced update.
    fn repair_patch_set_ref(
        &mut self,
        idx: usize,
        name: RefName,
        expected: Option<ObjectId>,
        commit: ObjectId,
    ) {
        let mut txn = RefTransaction::new(self.repo);
        let result = txn
            .add_update(name.clone(), expected, commit)
            .and_then(|()| txn.execute());
        match result {
            Ok(_) => self.fixed(idx, format!("Repaired ref {name}")),
            Err(err) => self.fix_failed(idx, err.to_string()),
        }
    }

    fn delete_patch_sets(
        &mut self,
        doc: &mut MetadataDocument<ChangeStrategy>,
        change: &Change,
        missing: Vec<(u32, usize)>,
    ) -> Result<(), DocumentError> {
        let active = change.active_patch_sets().count();
        if active <= missing.len() {
            for (_, idx) in missing {
                self.fix_failed(
                    idx,
                    "Cannot delete patch set; no patch sets would remain".to_owned(),
                );
            }
            return Ok(());
        }

        let ordinals: Vec<u32> = missing.iter().map(|(o, _)| *o).collect();
        let result = self.apply_record_fix(
            doc,
            &format!("Remove patch sets {ordinals:?} with missing commits"),
            |change| {
                for &ordinal in &ordinals {
                    if let Some(ps) = change.patch_sets.get_mut(&ordinal) {
                        ps.state = PatchSetState::Deleted;
                    }
                }
                if ordinals.contains(&change.current) {
                    if let Some(highest) = change.active_patch_sets().last() {
                        change.current = highest.ordinal;
                    }
                }
            },
            |run, txn| {
                for &ordinal in &ordinals {
                    let name = refs::patch_set(run.id, ordinal);
                    if let Some(observed) = run.repo.resolve(&name)? {
                        txn.add_delete(name, Some(observed))?;
                    }
                }
                Ok(())
            },
        );
        match result {
            Ok(()) => {
                for (ordinal, idx) in missing {
                    self.fixed(idx, format!("Deleted patch set {ordinal}"));
                }
            }
            Err(err) => {
                let outcome = err.to_string();
                for (_, idx) in missing {
                    self.fix_failed(idx, outcome.clone());
                }
            }
        }
        Ok(())
    }

    fn check_merged(
        &mut self,
        doc: &mut MetadataDocument<ChangeStrategy>,
    ) -> Result<(), DocumentError> {
        if let Some(expected) = self.fix.and_then(|f| f.expect_merged_as) {
            return self.check_expect_merged_as(doc, expected);
        }

        let change = doc.state().change.clone();
        let Some(current) = change.current_patch_set().copied() else {
            return Ok(());
        };
        if self.repo.try_commit(&current.commit)?.is_none() {
            return Ok(());
        }
        let dest = RefName::from(change.dest_branch.as_str());
        let Some(dest_tip) = self.repo.resolve(&dest)? else {
            return Ok(());
        };
        let merged = walk::is_ancestor(self.repo, &current.commit, &dest_tip)?;

        if merged && change.status != ChangeStatus::Merged {
            let idx = self.fixable_problem(format!(
                "Patch set {} ({}) is merged into {dest}, but change status is {}",
                current.ordinal,
                current.commit,
                change.status.as_str()
            ));
            if self.fixing() {
                let result = self.apply_record_fix(
                    doc,
                    "Mark change as merged",
                    |change| change.status = ChangeStatus::Merged,
                    |_, _| Ok(()),
                );
                match result {
                    Ok(()) => self.fixed(idx, "Marked change as merged".to_owned()),
                    Err(err) => self.fix_failed(idx, err.to_string()),
                }
            }
        } else if !merged && change.status == ChangeStatus::Merged {
            self.problem(format!(
                "Change is marked merged, but patch set {} ({}) is not merged into {dest}",
                current.ordinal, current.commit
            ));
        }
        Ok(())
    }

    /// Reconciles the record with a commit the caller asserts was merged.
    /// Which repair applies depends on how many patch set refs already point
    /// at that commit, and where they sit relative to the current patch set.
    fn check_expect_merged_as(
        &mut self,
        doc: &mut MetadataDocument<ChangeStrategy>,
        expected: ObjectId,
    ) -> Result<(), DocumentError> {
        let change = doc.state().change.clone();
        let dest = RefName::from(change.dest_branch.as_str());
        let Some(dest_tip) = self.repo.resolve(&dest)? else {
            self.problem(format!("Destination ref {dest} not found"));
            return Ok(());
        };
        if self.repo.try_commit(&expected)?.is_none()
            || !walk::is_ancestor(self.repo, &expected, &dest_tip)?
        {
            self.problem(format!(
                "Expected merged commit {expected} is not merged into {dest}"
            ));
            return Ok(());
        }

        let mut pointing: Vec<u32> = Vec::new();
        for (name, value) in self.repo.refs_with_prefix(&refs::change_prefix(self.id))? {
            if value != expected {
                continue;
            }
            if let Some((id, ordinal)) = refs::parse_patch_set(&name) {
                if id == self.id {
                    pointing.push(ordinal);
                }
            }
        }
        pointing.sort_unstable();

        match pointing.as_slice() {
            [] => {
                let idx = self.fixable_problem(format!(
                    "No patch set found for merged commit {expected}"
                ));
                if self.fixing() {
                    let fresh = change.next_ordinal();
                    let result = self.apply_record_fix(
                        doc,
                        &format!("Insert patch set for merged commit {expected}"),
                        |change| {
                            change.add_patch_set(expected);
                            change.status = ChangeStatus::Merged;
                        },
                        |run, txn| {
                            txn.add_update(refs::patch_set(run.id, fresh), None, expected)
                        },
                    );
                    match result {
                        Ok(()) => self.fixed(idx, format!("Inserted as patch set {fresh}")),
                        Err(err) => self.fix_failed(idx, err.to_string()),
                    }
                }
            }
            [ordinal] if *ordinal == change.current => {
                if change.status != ChangeStatus::Merged {
                    let idx = self.fixable_problem(format!(
                        "Change status is {} but current patch set is merged as {expected}",
                        change.status.as_str()
                    ));
                    if self.fixing() {
                        let result = self.apply_record_fix(
                            doc,
                            "Mark change as merged",
                            |change| change.status = ChangeStatus::Merged,
                            |_, _| Ok(()),
                        );
                        match result {
                            Ok(()) => self.fixed(idx, "Marked change as merged".to_owned()),
                            Err(err) => self.fix_failed(idx, err.to_string()),
                        }
                    }
                }
            }
            [ordinal] if *ordinal > change.current => {
                // A later patch set already records the merged commit; adopt
                // it as current rather than inventing a new one.
                let ordinal = *ordinal;
                let idx = self.fixable_problem(format!(
                    "Expected merged commit {expected} corresponds to patch set {ordinal}, \
                     not the current patch set {}",
                    change.current
                ));
                if self.fixing() {
                    let result = self.apply_record_fix(
                        doc,
                        &format!("Make patch set {ordinal} current and mark merged"),
                        |change| {
                            change.current = ordinal;
                            change.status = ChangeStatus::Merged;
                            let entry =
                                change.patch_sets.entry(ordinal).or_insert(PatchSet {
                                    ordinal,
                                    commit: expected,
                                    state: PatchSetState::Active,
                                });
                            // Realign a pre-existing entry with the ref too,
                            // or the adopted patch set names the wrong commit.
                            entry.commit = expected;
                            entry.state = PatchSetState::Active;
                        },
                        |_, _| Ok(()),
                    );
                    match result {
                        Ok(()) => {
                            self.fixed(idx, format!("Marked patch set {ordinal} as current"))
                        }
                        Err(err) => self.fix_failed(idx, err.to_string()),
                    }
                }
            }
            [ordinal] => {
                // The merged commit sits on an old patch set. Re-uploading
                // could reuse that ordinal, so retire it and record the
                // merged commit as a fresh patch set instead.
                let stale = *ordinal;
                let idx = self.fixable_problem(format!(
                    "Expected merged commit {expected} corresponds to stale patch set {stale}"
                ));
                if self.fixing() {
                    let fresh = change.next_ordinal();
                    let result = self.apply_record_fix(
                        doc,
                        &format!("Insert merged commit {expected} as patch set {fresh}"),
                        |change| {
                            if let Some(ps) = change.patch_sets.get_mut(&stale) {
                                ps.state = PatchSetState::Deleted;
                            }
                            change.add_patch_set(expected);
                            change.status = ChangeStatus::Merged;
                        },
                        |run, txn| {
                            txn.add_delete(refs::patch_set(run.id, stale), Some(expected))?;
                            txn.add_update(refs::patch_set(run.id, fresh), None, expected)
                        },
                    );
                    match result {
                        Ok(()) => self.fixed(idx, format!("Inserted as patch set {fresh}")),
                        Err(err) => self.fix_failed(idx, err.to_string()),
                    }
                }
            }
            many => {
                self.problem(format!(
                    "Multiple patch sets pointing to merged commit {expected}: {many:?}"
                ));
            }
        }
        Ok(())
    }

    /// Commits a record mutation and its accompanying ref commands in one
    /// transaction, then reloads the document so later fixes in the same
    /// run see the repaired state.
    fn apply_record_fix(
        &self,
        doc: &mut MetadataDocument<ChangeStrategy>,
        message: &str,
        mutate: impl FnOnce(&mut Change),
        ref_ops: impl FnOnce(&Self, &mut RefTransaction<'_>) -> Result<(), TransactionError>,
    ) -> Result<(), TransactionError> {
        mutate(&mut doc.state_mut().change);
        doc.state_mut().stage_message(message);

        let mut txn = RefTransaction::new(self.repo);
        ref_ops(self, &mut txn)?;
        {
            let mut update = doc.open_update(self.repo, self.identity.server())?;
            update.write()?;
            update.commit_to(&mut txn)?;
        }
        txn.execute()?;

        let reloaded = MetadataDocument::load(
            self.repo,
            ChangeStrategy::new(self.id),
            refs::change_meta(self.id),
        )?;
        *doc = reloaded;
        info!(change = %self.id, message, "applied consistency fix");
        Ok(())
    }
}

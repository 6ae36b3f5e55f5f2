//! Three-way merging over flat metadata trees.
//!
//! Merging happens at two levels. The tree level resolves each path by the
//! trivial rules (only one side changed, or both changed identically); paths
//! both sides changed differently fall down to the line level, a diff3 merge
//! of the blob contents. A strategy value decides how far that goes:
//! [`MergeStrategy::SimpleTwoWay`] refuses content merging outright, the
//! resolve/recursive strategies attempt it, and the one-sided strategies
//! skip merging entirely.
//!
//! A clean merge returns a tree; a failed one returns
//! [`MergeError::Conflict`] naming the files. Callers that want a tree
//! anyway use [`merge_with_markers`], which embeds git-style conflict
//! sections and reports the conflict as data ([`ConflictInfo`]) rather than
//! as an error.
//!
//! Nothing here touches refs, and nothing retries. Dry-run predicates
//! ([`can_merge`], [`can_cherry_pick`]) run against a [`ScratchGraph`] so
//! speculative objects never reach the shared store.

use std::collections::HashMap;
use std::fmt;

use itertools::Itertools;
use tracing::debug;

use crate::error::{MergeError, StorageError};
use crate::id::ObjectId;
use crate::ident::PersonIdent;
use crate::object::{Blob, Commit, Tree};
use crate::store::{ObjectGraph, ScratchGraph};
use crate::walk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Trivial tree-level rules only; any real collision is a conflict.
    SimpleTwoWay,
    /// Content merge, single merge base required.
    Resolve,
    /// Content merge; multiple merge bases are folded into a virtual base.
    Recursive,
    /// Take our tree wholesale.
    Ours,
    /// Take their tree wholesale.
    Theirs,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::SimpleTwoWay => "simple-two-way",
            MergeStrategy::Resolve => "resolve",
            MergeStrategy::Recursive => "recursive",
            MergeStrategy::Ours => "ours",
            MergeStrategy::Theirs => "theirs",
        }
    }

    fn supports_content_merge(self) -> bool {
        matches!(self, MergeStrategy::Resolve | MergeStrategy::Recursive)
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a merge has no single base commit to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoMergeBaseReason {
    /// The recursive strategy folded several bases into a synthetic tree
    /// that corresponds to no real commit.
    ComputedBaseUnavailable,
    /// A one-sided strategy never computes a base.
    OneSidedStrategy,
    NoCommonAncestor,
}

/// The base a merge was (or was not) computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeBase {
    Commit(ObjectId),
    NotAvailable(NoMergeBaseReason),
}

/// A conflict described as data: which inputs collided, under which
/// strategy, in which files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub base: MergeBase,
    pub ours: ObjectId,
    pub theirs: ObjectId,
    pub strategy: MergeStrategy,
    pub files: Vec<String>,
}

fn tree_of<G: ObjectGraph + ?Sized>(graph: &G, commit: ObjectId) -> Result<Tree, StorageError> {
    let commit = graph.commit(&commit)?;
    graph.tree(&commit.tree)
}

/// Decodes a blob as text; `None` when the blob is absent from the tree,
/// `Some(None)` when it exists but is not UTF-8.
fn read_text<G: ObjectGraph + ?Sized>(
    graph: &G,
    id: Option<ObjectId>,
) -> Result<Option<Option<String>>, StorageError> {
    match id {
        None => Ok(None),
        Some(id) => {
            let blob = graph.blob(&id)?;
            Ok(Some(
                std::str::from_utf8(blob.as_bytes()).ok().map(str::to_owned),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// base resolution

fn ident_for_virtual_base() -> PersonIdent {
    PersonIdent {
        name: "virtual merge base".into(),
        email: String::new(),
        when_secs: 0,
    }
}

const MAX_BASE_RECURSION: u32 = 32;

/// Folds two candidate bases into one synthetic base commit by recursively
/// merging them. A conflict inside the base computation fails the merge.
fn virtual_base<G: ObjectGraph + ?Sized>(
    graph: &G,
    a: ObjectId,
    b: ObjectId,
    depth: u32,
) -> Result<ObjectId, MergeError> {
    if depth >= MAX_BASE_RECURSION {
        return Err(StorageError::Corrupt("merge base recursion too deep".into()).into());
    }
    let (base_tree, _) = resolve_base(graph, MergeStrategy::Recursive, a, b, depth + 1)?;
    let merged = merge_trees_by(
        graph,
        MergeStrategy::Recursive,
        &base_tree,
        &tree_of(graph, a)?,
        &tree_of(graph, b)?,
    )?;
    let tree = graph.put_tree(merged)?;
    let ident = ident_for_virtual_base();
    let id = graph.put_commit(Commit {
        tree,
        parents: vec![a, b],
        author: ident.clone(),
        committer: ident,
        message: "virtual merge base".into(),
    })?;
    Ok(id)
}

fn resolve_base<G: ObjectGraph + ?Sized>(
    graph: &G,
    strategy: MergeStrategy,
    ours: ObjectId,
    theirs: ObjectId,
    depth: u32,
) -> Result<(Tree, MergeBase), MergeError> {
    if !matches!(
        strategy,
        MergeStrategy::SimpleTwoWay | MergeStrategy::Resolve | MergeStrategy::Recursive
    ) {
        return Ok((
            Tree::new(),
            MergeBase::NotAvailable(NoMergeBaseReason::OneSidedStrategy),
        ));
    }
    let bases = walk::merge_bases(graph, &ours, &theirs)?;
    match bases.len() {
        0 => Ok((
            Tree::new(),
            MergeBase::NotAvailable(NoMergeBaseReason::NoCommonAncestor),
        )),
        1 => Ok((tree_of(graph, bases[0])?, MergeBase::Commit(bases[0]))),
        _ if strategy == MergeStrategy::Recursive => {
            let mut folded = bases[0];
            for &next in &bases[1..] {
                folded = virtual_base(graph, folded, next, depth)?;
            }
            debug!(ours = %ours.short(), theirs = %theirs.short(), "computed virtual merge base");
            Ok((
                tree_of(graph, folded)?,
                MergeBase::NotAvailable(NoMergeBaseReason::ComputedBaseUnavailable),
            ))
        }
        _ => Err(MergeError::MultipleMergeBases { ours, theirs }),
    }
}

// ---------------------------------------------------------------------------
// line-level diff3

struct Hunk {
    a_lo: usize,
    a_hi: usize,
    b_lo: usize,
    b_hi: usize,
}

/// Non-matching regions between two line sequences, by LCS. Metadata files
/// are small, so the quadratic table is acceptable.
fn diff_hunks(a: &[&str], b: &[&str]) -> Vec<Hunk> {
    let n = a.len();
    let m = b.len();
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut hunks = Vec::new();
    let (mut i, mut j) = (0, 0);
    let (mut a_lo, mut b_lo) = (0, 0);
    let mut open = false;
    while i < n && j < m {
        if a[i] == b[j] && lcs[i][j] == lcs[i + 1][j + 1] + 1 {
            if open {
                hunks.push(Hunk { a_lo, a_hi: i, b_lo, b_hi: j });
                open = false;
            }
            i += 1;
            j += 1;
        } else {
            if !open {
                a_lo = i;
                b_lo = j;
                open = true;
            }
            if lcs[i + 1][j] >= lcs[i][j + 1] {
                i += 1;
            } else {
                j += 1;
            }
        }
    }
    if open {
        hunks.push(Hunk { a_lo, a_hi: n, b_lo, b_hi: m });
    } else if i < n || j < m {
        hunks.push(Hunk { a_lo: i, a_hi: n, b_lo: j, b_hi: m });
    }
    hunks
}

enum MergeChunk {
    Stable(String),
    Conflict {
        base: String,
        ours: String,
        theirs: String,
    },
}

fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// diff3: changes from either side against the base are taken when only one
/// side touched a region (or both made the same change); overlapping,
/// differing changes become conflict chunks.
fn merge_lines(base: &str, ours: &str, theirs: &str) -> Vec<MergeChunk> {
    let b = split_lines(base);
    let o = split_lines(ours);
    let t = split_lines(theirs);
    let ho = diff_hunks(&b, &o);
    let ht = diff_hunks(&b, &t);

    let mut chunks = Vec::new();
    let mut stable = String::new();
    let (mut i, mut j) = (0, 0);
    let (mut bp, mut op, mut tp) = (0usize, 0usize, 0usize);

    while i < ho.len() || j < ht.len() {
        let next = match (ho.get(i), ht.get(j)) {
            (Some(x), Some(y)) => x.a_lo.min(y.a_lo),
            (Some(x), None) => x.a_lo,
            (None, Some(y)) => y.a_lo,
            (None, None) => break,
        };
        stable.push_str(&b[bp..next].concat());
        op += next - bp;
        tp += next - bp;
        bp = next;

        // Grow a combined region over every hunk, from either side, that
        // strictly overlaps it. Hunks that merely touch the region's end
        // stay separate, so edits on adjacent lines merge cleanly. While the
        // region is still empty a hunk starting exactly at it is absorbed,
        // which seeds the region and makes insertions at the same point from
        // both sides collide.
        let mut hi = next;
        let mut last_o: Option<&Hunk> = None;
        let mut last_t: Option<&Hunk> = None;
        loop {
            let mut grew = false;
            while let Some(h) = ho.get(i) {
                if h.a_lo >= hi && !(h.a_lo == hi && hi == next) {
                    break;
                }
                hi = hi.max(h.a_hi);
                last_o = Some(h);
                i += 1;
                grew = true;
            }
            while let Some(h) = ht.get(j) {
                if h.a_lo >= hi && !(h.a_lo == hi && hi == next) {
                    break;
                }
                hi = hi.max(h.a_hi);
                last_t = Some(h);
                j += 1;
                grew = true;
            }
            if !grew {
                break;
            }
        }

        let o_hi = match last_o {
            Some(h) => h.b_hi + (hi - h.a_hi),
            None => op + (hi - bp),
        };
        let t_hi = match last_t {
            Some(h) => h.b_hi + (hi - h.a_hi),
            None => tp + (hi - bp),
        };
        let base_s = b[bp..hi].concat();
        let ours_s = o[op..o_hi].concat();
        let theirs_s = t[tp..t_hi].concat();

        if ours_s == base_s {
            stable.push_str(&theirs_s);
        } else if theirs_s == base_s || ours_s == theirs_s {
            stable.push_str(&ours_s);
        } else {
            if !stable.is_empty() {
                chunks.push(MergeChunk::Stable(std::mem::take(&mut stable)));
            }
            chunks.push(MergeChunk::Conflict {
                base: base_s,
                ours: ours_s,
                theirs: theirs_s,
            });
        }
        bp = hi;
        op = o_hi;
        tp = t_hi;
    }
    stable.push_str(&b[bp..].concat());
    if !stable.is_empty() {
        chunks.push(MergeChunk::Stable(stable));
    }
    chunks
}

fn is_clean(chunks: &[MergeChunk]) -> bool {
    chunks.iter().all(|c| matches!(c, MergeChunk::Stable(_)))
}

fn concat_stable(chunks: &[MergeChunk]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        if let MergeChunk::Stable(text) = chunk {
            out.push_str(text);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// conflict markers

/// Marker layout inside a conflicted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictFormat {
    /// Ours and theirs only.
    TwoWay,
    /// Ours, base and theirs.
    Diff3,
}

/// Labels appended to the conflict markers.
#[derive(Debug, Clone)]
pub struct MergeLabels {
    pub ours: String,
    pub theirs: String,
    pub base: String,
}

fn format_label(name: &str, id: &ObjectId, commit: &Commit) -> String {
    let subject: String = commit.subject().chars().take(60).collect();
    // Pad the side names to a common width so the markers line up.
    format!("{name:<6} ({} {})", id.short(), subject)
}

/// `ours`/`theirs` labels carrying the abbreviated id and subject of each
/// side, the way a reviewer expects to see them in a conflicted file.
pub fn default_labels<G: ObjectGraph + ?Sized>(
    graph: &G,
    ours: ObjectId,
    theirs: ObjectId,
) -> Result<MergeLabels, StorageError> {
    let ours_commit = graph.commit(&ours)?;
    let theirs_commit = graph.commit(&theirs)?;
    Ok(MergeLabels {
        ours: format_label("ours", &ours, &ours_commit),
        theirs: format_label("theirs", &theirs, &theirs_commit),
        base: "base".to_owned(),
    })
}

fn ensure_newline(text: &mut String) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
}

fn render_with_markers(
    chunks: &[MergeChunk],
    format: ConflictFormat,
    labels: &MergeLabels,
) -> String {
    let mut out = String::new();
    for chunk in chunks {
        match chunk {
            MergeChunk::Stable(text) => out.push_str(text),
            MergeChunk::Conflict { base, ours, theirs } => {
                ensure_newline(&mut out);
                out.push_str(&format!("<<<<<<< {}\n", labels.ours));
                out.push_str(ours);
                ensure_newline(&mut out);
                if format == ConflictFormat::Diff3 {
                    out.push_str(&format!("||||||| {}\n", labels.base));
                    out.push_str(base);
                    ensure_newline(&mut out);
                }
                out.push_str("=======\n");
                out.push_str(theirs);
                ensure_newline(&mut out);
                out.push_str(&format!(">>>>>>> {}\n", labels.theirs));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// tree-level merging

fn union_paths<'t>(base: &'t Tree, ours: &'t Tree, theirs: &'t Tree) -> Vec<&'t str> {
    // paths() iterates in sorted order, so a sorted merge + dedup gives the
    // union without an intermediate set.
    base.paths()
        .merge(ours.paths())
        .merge(theirs.paths())
        .dedup()
        .collect()
}

/// Resolves a path by the trivial rules. `Err(())` means both sides changed
/// it differently and content merging has to decide.
fn trivial_entry(
    base: Option<ObjectId>,
    ours: Option<ObjectId>,
    theirs: Option<ObjectId>,
) -> Result<Option<ObjectId>, ()> {
    if ours == theirs {
        Ok(ours)
    } else if ours == base {
        Ok(theirs)
    } else if theirs == base {
        Ok(ours)
    } else {
        Err(())
    }
}

/// Merges two trees against a base. Clean or [`MergeError::Conflict`].
pub fn merge_trees_by<G: ObjectGraph + ?Sized>(
    graph: &G,
    strategy: MergeStrategy,
    base: &Tree,
    ours: &Tree,
    theirs: &Tree,
) -> Result<Tree, MergeError> {
    let mut out = Tree::new();
    let mut conflicts = Vec::new();
    for path in union_paths(base, ours, theirs) {
        let (b, o, t) = (base.get(path), ours.get(path), theirs.get(path));
        match trivial_entry(b, o, t) {
            Ok(Some(id)) => out.insert(path, id),
            Ok(None) => {}
            Err(()) => {
                if strategy.supports_content_merge() {
                    if let Some(merged) = content_merge(graph, b, o, t)? {
                        out.insert(path, graph.put_blob(Blob::new(merged.into_bytes()))?);
                        continue;
                    }
                }
                conflicts.push(path.to_owned());
            }
        }
    }
    if conflicts.is_empty() {
        Ok(out)
    } else {
        Err(MergeError::Conflict { files: conflicts })
    }
}

/// Line merge of one path, `None` when the sides cannot be merged cleanly
/// (deleted on one side, not text, or genuinely conflicting).
fn content_merge<G: ObjectGraph + ?Sized>(
    graph: &G,
    base: Option<ObjectId>,
    ours: Option<ObjectId>,
    theirs: Option<ObjectId>,
) -> Result<Option<String>, StorageError> {
    let (Some(Some(ours)), Some(Some(theirs))) = (read_text(graph, ours)?, read_text(graph, theirs)?)
    else {
        return Ok(None);
    };
    let base = read_text(graph, base)?.flatten().unwrap_or_default();
    let chunks = merge_lines(&base, &ours, &theirs);
    if is_clean(&chunks) {
        Ok(Some(concat_stable(&chunks)))
    } else {
        Ok(None)
    }
}

/// The three stages of a conflicted path, in ascending precedence of the
/// "keep the higher stage" fallback.
fn collapse_stages(
    base: Option<ObjectId>,
    ours: Option<ObjectId>,
    theirs: Option<ObjectId>,
) -> Option<ObjectId> {
    let present: Vec<ObjectId> = [base, ours, theirs].into_iter().flatten().collect();
    match present.len() {
        // Two stages: the higher one wins, so a modification beats the
        // stale base entry.
        2 => present.last().copied(),
        // All three differ and no content merge applies: keep the base and
        // let a human sort it out.
        3 => present.first().copied(),
        _ => present.first().copied(),
    }
}

/// A merge result that always yields a tree, with conflicts embedded as
/// marker sections and reported as data.
#[derive(Debug, Clone)]
pub struct MarkedTree {
    pub tree: ObjectId,
    pub conflict: Option<ConflictInfo>,
}

/// Merges `ours` and `theirs`, embedding conflict markers instead of
/// failing. Only content-merging strategies can produce marked output.
pub fn merge_with_markers<G: ObjectGraph + ?Sized>(
    graph: &G,
    strategy: MergeStrategy,
    format: ConflictFormat,
    ours: ObjectId,
    theirs: ObjectId,
    labels: &MergeLabels,
) -> Result<MarkedTree, MergeError> {
    if !strategy.supports_content_merge() {
        return Err(MergeError::MarkersNotSupported(strategy.as_str()));
    }
    let (base_tree, merge_base) = resolve_base(graph, strategy, ours, theirs, 0)?;
    let ours_tree = tree_of(graph, ours)?;
    let theirs_tree = tree_of(graph, theirs)?;
    let (tree, files) = marked_tree_merge(
        graph,
        format,
        labels,
        &base_tree,
        &ours_tree,
        &theirs_tree,
    )?;
    let tree = graph.put_tree(tree)?;
    let conflict = if files.is_empty() {
        None
    } else {
        Some(ConflictInfo {
            base: merge_base,
            ours,
            theirs,
            strategy,
            files,
        })
    };
    Ok(MarkedTree { tree, conflict })
}

fn marked_tree_merge<G: ObjectGraph + ?Sized>(
    graph: &G,
    format: ConflictFormat,
    labels: &MergeLabels,
    base: &Tree,
    ours: &Tree,
    theirs: &Tree,
) -> Result<(Tree, Vec<String>), MergeError> {
    let mut out = Tree::new();
    let mut files = Vec::new();
    for path in union_paths(base, ours, theirs) {
        let (b, o, t) = (base.get(path), ours.get(path), theirs.get(path));
        match trivial_entry(b, o, t) {
            Ok(Some(id)) => out.insert(path, id),
            Ok(None) => {}
            Err(()) => {
                let texts = (read_text(graph, o)?, read_text(graph, t)?);
                if let (Some(Some(ours_text)), Some(Some(theirs_text))) = texts {
                    let base_text = read_text(graph, b)?.flatten().unwrap_or_default();
                    let chunks = merge_lines(&base_text, &ours_text, &theirs_text);
                    if is_clean(&chunks) {
                        let merged = concat_stable(&chunks);
                        out.insert(path, graph.put_blob(Blob::new(merged.into_bytes()))?);
                    } else {
                        let marked = render_with_markers(&chunks, format, labels);
                        out.insert(path, graph.put_blob(Blob::new(marked.into_bytes()))?);
                        files.push(path.to_owned());
                    }
                } else {
                    // One side is gone or not text; no markers possible.
                    if let Some(id) = collapse_stages(b, o, t) {
                        out.insert(path, id);
                    }
                    files.push(path.to_owned());
                }
            }
        }
    }
    Ok((out, files))
}

// ---------------------------------------------------------------------------
// commit-level operations

/// Merges `theirs` into `ours`, producing a two-parent commit, or the
/// `theirs` id itself when a fast-forward suffices.
pub fn merge_commits<G: ObjectGraph + ?Sized>(
    graph: &G,
    committer: &PersonIdent,
    strategy: MergeStrategy,
    ours: ObjectId,
    theirs: ObjectId,
    message: &str,
) -> Result<ObjectId, MergeError> {
    if walk::is_ancestor(graph, &theirs, &ours)? && strategy != MergeStrategy::Theirs {
        return Err(MergeError::AlreadyMerged(theirs));
    }
    if walk::is_ancestor(graph, &ours, &theirs)? && strategy != MergeStrategy::Ours {
        return Ok(theirs);
    }

    let tree = match strategy {
        MergeStrategy::Ours => graph.commit(&ours)?.tree,
        MergeStrategy::Theirs => graph.commit(&theirs)?.tree,
        _ => {
            let (base_tree, _) = resolve_base(graph, strategy, ours, theirs, 0)?;
            let merged = merge_trees_by(
                graph,
                strategy,
                &base_tree,
                &tree_of(graph, ours)?,
                &tree_of(graph, theirs)?,
            )?;
            graph.put_tree(merged)?
        }
    };
    let id = graph.put_commit(Commit {
        tree,
        parents: vec![ours, theirs],
        author: committer.clone(),
        committer: committer.clone(),
        message: message.to_owned(),
    })?;
    Ok(id)
}

#[derive(Debug, Clone)]
pub struct CherryPickOptions {
    /// Which parent of the picked commit serves as the merge base.
    pub parent_index: usize,
    /// Embed conflict markers instead of failing on conflict.
    pub allow_conflicts: bool,
    pub format: ConflictFormat,
    /// Accept a pick whose tree equals the target's tree.
    pub ignore_identical_tree: bool,
}

impl Default for CherryPickOptions {
    fn default() -> Self {
        CherryPickOptions {
            parent_index: 0,
            allow_conflicts: false,
            format: ConflictFormat::TwoWay,
            ignore_identical_tree: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CherryPickOutcome {
    pub commit: ObjectId,
    pub conflict: Option<ConflictInfo>,
}

/// Re-applies `pick` on top of `onto` as a single-parent commit, keeping
/// the picked commit's author and message.
pub fn cherry_pick<G: ObjectGraph + ?Sized>(
    graph: &G,
    committer: &PersonIdent,
    strategy: MergeStrategy,
    onto: ObjectId,
    pick: ObjectId,
    opts: &CherryPickOptions,
) -> Result<CherryPickOutcome, MergeError> {
    let pick_commit = graph.commit(&pick)?;
    let base = pick_commit
        .parents
        .get(opts.parent_index)
        .copied()
        .ok_or(MergeError::NoParentToPick)?;
    let onto_commit = graph.commit(&onto)?;
    let base_tree = tree_of(graph, base)?;
    let onto_tree = graph.tree(&onto_commit.tree)?;
    let pick_tree = graph.tree(&pick_commit.tree)?;

    let (tree, conflict) =
        match merge_trees_by(graph, strategy, &base_tree, &onto_tree, &pick_tree) {
            Ok(tree) => (graph.put_tree(tree)?, None),
            Err(MergeError::Conflict { .. }) if opts.allow_conflicts => {
                if !strategy.supports_content_merge() {
                    return Err(MergeError::MarkersNotSupported(strategy.as_str()));
                }
                let labels = default_labels(graph, onto, pick)?;
                let (tree, files) = marked_tree_merge(
                    graph,
                    opts.format,
                    &labels,
                    &base_tree,
                    &onto_tree,
                    &pick_tree,
                )?;
                let info = ConflictInfo {
                    base: MergeBase::Commit(base),
                    ours: onto,
                    theirs: pick,
                    strategy,
                    files,
                };
                (graph.put_tree(tree)?, Some(info))
            }
            Err(err) => return Err(err),
        };

    if conflict.is_none() && tree == onto_commit.tree && !opts.ignore_identical_tree {
        return Err(MergeError::IdenticalTree);
    }
    let id = graph.put_commit(Commit {
        tree,
        parents: vec![onto],
        author: pick_commit.author.clone(),
        committer: committer.clone(),
        message: pick_commit.message.clone(),
    })?;
    Ok(CherryPickOutcome { commit: id, conflict })
}

// ---------------------------------------------------------------------------
// dry-run predicates

/// True when `candidate` can become the new tip without a merge commit.
pub fn can_fast_forward<G: ObjectGraph + ?Sized>(
    graph: &G,
    tip: Option<ObjectId>,
    candidate: ObjectId,
) -> Result<bool, StorageError> {
    match tip {
        None => Ok(true),
        Some(tip) => walk::is_ancestor(graph, &tip, &candidate),
    }
}

/// True when `candidate` merges cleanly into `tip` under `strategy`.
/// Speculative objects go into a scratch overlay and are discarded.
pub fn can_merge<G: ObjectGraph + ?Sized>(
    graph: &G,
    strategy: MergeStrategy,
    tip: ObjectId,
    candidate: ObjectId,
) -> Result<bool, StorageError> {
    if matches!(strategy, MergeStrategy::Ours | MergeStrategy::Theirs) {
        return Ok(true);
    }
    let scratch = ScratchGraph::new(graph);
    let attempt = resolve_base(&scratch, strategy, tip, candidate, 0).and_then(|(base, _)| {
        merge_trees_by(
            &scratch,
            strategy,
            &base,
            &tree_of(&scratch, tip)?,
            &tree_of(&scratch, candidate)?,
        )
    });
    match attempt {
        Ok(_) => Ok(true),
        Err(MergeError::Storage(err)) => Err(err),
        Err(_) => Ok(false),
    }
}

/// True when `candidate` cherry-picks cleanly onto `tip` (first parent as
/// base). Root commits cannot be picked.
pub fn can_cherry_pick<G: ObjectGraph + ?Sized>(
    graph: &G,
    strategy: MergeStrategy,
    tip: ObjectId,
    candidate: ObjectId,
) -> Result<bool, StorageError> {
    let pick = graph.commit(&candidate)?;
    let Some(base) = pick.first_parent() else {
        return Ok(false);
    };
    let scratch = ScratchGraph::new(graph);
    let attempt = (|| -> Result<Tree, MergeError> {
        merge_trees_by(
            &scratch,
            strategy,
            &tree_of(&scratch, base)?,
            &tree_of(&scratch, tip)?,
            &scratch.tree(&pick.tree)?,
        )
    })();
    match attempt {
        Ok(_) => Ok(true),
        Err(MergeError::Storage(err)) => Err(err),
        Err(_) => Ok(false),
    }
}

// ---------------------------------------------------------------------------
// integration queue

/// How candidates are integrated into the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitKind {
    FastForwardOnly,
    MergeIfNecessary,
    CherryPick,
}

/// Per-commit outcome of a queue evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMergeStatus {
    CleanMerge,
    CleanFastForward,
    CleanPick,
    AlreadyMerged,
    PathConflict,
    NotFastForward,
    CannotCherryPick,
    /// An ancestor of this commit is neither merged nor cleanly mergeable.
    MissingDependency,
}

impl CommitMergeStatus {
    pub fn is_ok(self) -> bool {
        matches!(
            self,
            CommitMergeStatus::CleanMerge
                | CommitMergeStatus::CleanFastForward
                | CommitMergeStatus::CleanPick
                | CommitMergeStatus::AlreadyMerged
        )
    }
}

/// Explicit side table of per-commit merge outcomes. Traversal never stores
/// state on commits; everything a queue run learns about a commit lands
/// here, including the files a conflicting candidate collided in.
#[derive(Debug, Default)]
pub struct MergeStatusTable {
    entries: HashMap<ObjectId, (CommitMergeStatus, Vec<String>)>,
}

impl MergeStatusTable {
    pub fn new() -> Self {
        MergeStatusTable::default()
    }

    pub fn get(&self, id: &ObjectId) -> Option<CommitMergeStatus> {
        self.entries.get(id).map(|(s, _)| *s)
    }

    /// The files a path-conflicting candidate collided in, when known.
    pub fn conflicts(&self, id: &ObjectId) -> &[String] {
        self.entries.get(id).map_or(&[], |(_, files)| files)
    }

    pub fn set(&mut self, id: ObjectId, status: CommitMergeStatus) {
        self.entries.insert(id, (status, Vec::new()));
    }

    pub fn set_conflict(&mut self, id: ObjectId, status: CommitMergeStatus, files: Vec<String>) {
        self.entries.insert(id, (status, files));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, CommitMergeStatus)> {
        self.entries.iter().map(|(id, (s, _))| (id, *s))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of one queue evaluation: the tip after all integrations plus the
/// status of every candidate.
#[derive(Debug)]
pub struct QueueOutcome {
    pub tip: Option<ObjectId>,
    pub statuses: MergeStatusTable,
}

/// Integrates `candidates` (in dependency order) into the branch at `tip`.
///
/// Failures are partial: a candidate that cannot integrate is recorded and
/// skipped, and candidates depending on it fail with `MissingDependency`,
/// while independent candidates still land.
pub fn evaluate_queue<G: ObjectGraph + ?Sized>(
    graph: &G,
    committer: &PersonIdent,
    strategy: MergeStrategy,
    kind: SubmitKind,
    tip: Option<ObjectId>,
    candidates: &[ObjectId],
) -> Result<QueueOutcome, StorageError> {
    let mut tip = tip;
    let mut statuses = MergeStatusTable::new();

    for &candidate in candidates {
        // Ancestry-tracking kinds must see every dependency merged first.
        if kind != SubmitKind::CherryPick {
            let pending = walk::unmerged(graph, &candidate, tip.as_ref())?;
            if pending.is_empty() {
                statuses.set(candidate, CommitMergeStatus::AlreadyMerged);
                continue;
            }
            if pending.iter().any(|c| *c != candidate) {
                statuses.set(candidate, CommitMergeStatus::MissingDependency);
                continue;
            }
        } else if let Some(tip) = tip {
            if walk::is_ancestor(graph, &candidate, &tip)? {
                statuses.set(candidate, CommitMergeStatus::AlreadyMerged);
                continue;
            }
        }

        match kind {
            SubmitKind::FastForwardOnly => {
                if can_fast_forward(graph, tip, candidate)? {
                    tip = Some(candidate);
                    statuses.set(candidate, CommitMergeStatus::CleanFastForward);
                } else {
                    statuses.set(candidate, CommitMergeStatus::NotFastForward);
                }
            }
            SubmitKind::MergeIfNecessary => {
                if can_fast_forward(graph, tip, candidate)? {
                    tip = Some(candidate);
                    statuses.set(candidate, CommitMergeStatus::CleanFastForward);
                    continue;
                }
                let current = match tip {
                    Some(tip) => tip,
                    None => {
                        tip = Some(candidate);
                        statuses.set(candidate, CommitMergeStatus::CleanFastForward);
                        continue;
                    }
                };
                let subject = graph.commit(&candidate)?.subject().to_owned();
                let message = format!("Merge \"{subject}\"");
                match merge_commits(graph, committer, strategy, current, candidate, &message) {
                    Ok(merged) => {
                        tip = Some(merged);
                        statuses.set(candidate, CommitMergeStatus::CleanMerge);
                    }
                    Err(MergeError::AlreadyMerged(_)) => {
                        statuses.set(candidate, CommitMergeStatus::AlreadyMerged);
                    }
                    Err(MergeError::Storage(err)) => return Err(err),
                    Err(MergeError::Conflict { files }) => {
                        debug!(candidate = %candidate.short(), ?files, "integration conflict");
                        statuses.set_conflict(candidate, CommitMergeStatus::PathConflict, files);
                    }
                    Err(err) => {
                        debug!(candidate = %candidate.short(), error = %err, "integration failed");
                        statuses.set(candidate, CommitMergeStatus::PathConflict);
                    }
                }
            }
            SubmitKind::CherryPick => {
                let current = match tip {
                    Some(tip) => tip,
                    None => {
                        tip = Some(candidate);
                        statuses.set(candidate, CommitMergeStatus::CleanFastForward);
                        continue;
                    }
                };
                let opts = CherryPickOptions::default();
                match cherry_pick(graph, committer, strategy, current, candidate, &opts) {
                    Ok(outcome) => {
                        tip = Some(outcome.commit);
                        statuses.set(candidate, CommitMergeStatus::CleanPick);
                    }
                    Err(MergeError::IdenticalTree) => {
                        statuses.set(candidate, CommitMergeStatus::AlreadyMerged);
                    }
                    Err(MergeError::NoParentToPick) => {
                        statuses.set(candidate, CommitMergeStatus::CannotCherryPick);
                    }
                    Err(MergeError::Storage(err)) => return Err(err),
                    Err(MergeError::Conflict { files }) => {
                        debug!(candidate = %candidate.short(), ?files, "pick conflict");
                        statuses.set_conflict(candidate, CommitMergeStatus::PathConflict, files);
                    }
                    Err(err) => {
                        debug!(candidate = %candidate.short(), error = %err, "pick failed");
                        statuses.set(candidate, CommitMergeStatus::PathConflict);
                    }
                }
            }
        }
    }

    Ok(QueueOutcome { tip, statuses })
}

use proptest::prelude::*;

use reviewdb::error::MergeError;
use reviewdb::id::ObjectId;
use reviewdb::merge::{
    can_cherry_pick, can_fast_forward, can_merge, cherry_pick, default_labels, evaluate_queue,
    merge_commits, merge_with_markers, CherryPickOptions, CommitMergeStatus, ConflictFormat,
    MergeBase, MergeStrategy, NoMergeBaseReason, SubmitKind,
};
use reviewdb::store::memory::MemoryRepository;
use reviewdb::store::ObjectGraph;

mod util;
use util::{commit_with, ident};

fn file_text(repo: &MemoryRepository, commit: ObjectId, path: &str) -> String {
    let commit = repo.commit(&commit).unwrap();
    let tree = repo.tree(&commit.tree).unwrap();
    let blob = repo.blob(&tree.get(path).unwrap()).unwrap();
    String::from_utf8(blob.as_bytes().to_vec()).unwrap()
}

fn tree_text(repo: &MemoryRepository, tree: ObjectId, path: &str) -> String {
    let tree = repo.tree(&tree).unwrap();
    let blob = repo.blob(&tree.get(path).unwrap()).unwrap();
    String::from_utf8(blob.as_bytes().to_vec()).unwrap()
}

#[test]
fn non_overlapping_edits_merge_cleanly() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\nb\nc\nd\n")], "base");
    let ours = commit_with(&repo, vec![base], &[("f", "A\nb\nc\nd\n")], "ours");
    let theirs = commit_with(&repo, vec![base], &[("f", "a\nb\nc\nD\n")], "theirs");

    let merged = merge_commits(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        ours,
        theirs,
        "Merge \"theirs\"",
    )
    .unwrap();
    assert_eq!(file_text(&repo, merged, "f"), "A\nb\nc\nD\n");
    assert_eq!(repo.commit(&merged).unwrap().parents, vec![ours, theirs]);
}

#[test]
fn fast_forward_short_circuits_to_theirs() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\n")], "base");
    let next = commit_with(&repo, vec![base], &[("f", "b\n")], "next");
    let merged = merge_commits(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        base,
        next,
        "msg",
    )
    .unwrap();
    assert_eq!(merged, next);
}

#[test]
fn merging_an_ancestor_is_already_merged() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\n")], "base");
    let next = commit_with(&repo, vec![base], &[("f", "b\n")], "next");
    let err = merge_commits(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        next,
        base,
        "msg",
    )
    .unwrap_err();
    assert!(matches!(err, MergeError::AlreadyMerged(c) if c == base));
}

#[test]
fn simple_two_way_refuses_content_merging() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\nb\n")], "base");
    let ours = commit_with(&repo, vec![base], &[("f", "x\nb\n")], "ours");
    let theirs = commit_with(&repo, vec![base], &[("f", "a\ny\n")], "theirs");

    let err = merge_commits(
        &repo,
        &ident("server"),
        MergeStrategy::SimpleTwoWay,
        ours,
        theirs,
        "msg",
    )
    .unwrap_err();
    assert!(matches!(err, MergeError::Conflict { ref files } if files == &["f".to_string()]));

    // The same inputs content-merge fine under resolve.
    merge_commits(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        ours,
        theirs,
        "msg",
    )
    .unwrap();
}

#[test]
fn conflict_markers_surround_exactly_the_conflicting_hunk() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "top\nmid\nbottom\n")], "base");
    let ours = commit_with(&repo, vec![base], &[("f", "top\nours\nbottom\n")], "ours");
    let theirs = commit_with(&repo, vec![base], &[("f", "top\ntheirs\nbottom\n")], "theirs");

    let labels = default_labels(&repo, ours, theirs).unwrap();
    let marked = merge_with_markers(
        &repo,
        MergeStrategy::Resolve,
        ConflictFormat::TwoWay,
        ours,
        theirs,
        &labels,
    )
    .unwrap();

    let info = marked.conflict.unwrap();
    assert_eq!(info.files, vec!["f".to_string()]);
    assert_eq!(info.base, MergeBase::Commit(base));
    assert_eq!(info.strategy, MergeStrategy::Resolve);

    let text = tree_text(&repo, marked.tree, "f");
    // Exactly one marker set, and the untouched lines are byte-identical.
    assert_eq!(text.matches("<<<<<<<").count(), 1);
    assert_eq!(text.matches("=======").count(), 1);
    assert_eq!(text.matches(">>>>>>>").count(), 1);
    assert!(text.starts_with("top\n"));
    assert!(text.ends_with("bottom\n"));
    assert!(text.contains("ours\n=======\ntheirs\n"));
    // Labels carry the abbreviated id and subject of each side.
    assert!(text.contains(&ours.short()));
    assert!(text.contains(&theirs.short()));
    assert!(!text.contains("|||||||"));
}

#[test]
fn diff3_markers_include_the_base_section() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "mid\n")], "base");
    let ours = commit_with(&repo, vec![base], &[("f", "ours\n")], "ours");
    let theirs = commit_with(&repo, vec![base], &[("f", "theirs\n")], "theirs");

    let labels = default_labels(&repo, ours, theirs).unwrap();
    let marked = merge_with_markers(
        &repo,
        MergeStrategy::Resolve,
        ConflictFormat::Diff3,
        ours,
        theirs,
        &labels,
    )
    .unwrap();
    let text = tree_text(&repo, marked.tree, "f");
    assert!(text.contains("||||||| base\nmid\n=======\n"));
}

#[test]
fn markers_require_a_content_merging_strategy() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\n")], "base");
    let ours = commit_with(&repo, vec![base], &[("f", "x\n")], "ours");
    let theirs = commit_with(&repo, vec![base], &[("f", "y\n")], "theirs");
    let labels = default_labels(&repo, ours, theirs).unwrap();
    let err = merge_with_markers(
        &repo,
        MergeStrategy::SimpleTwoWay,
        ConflictFormat::TwoWay,
        ours,
        theirs,
        &labels,
    )
    .unwrap_err();
    assert!(matches!(err, MergeError::MarkersNotSupported(_)));
}

#[test]
fn unrelated_histories_report_no_common_ancestor() {
    let repo = MemoryRepository::new();
    let ours = commit_with(&repo, vec![], &[("f", "x\n")], "ours");
    let theirs = commit_with(&repo, vec![], &[("f", "y\n")], "theirs");

    let labels = default_labels(&repo, ours, theirs).unwrap();
    let marked = merge_with_markers(
        &repo,
        MergeStrategy::Resolve,
        ConflictFormat::TwoWay,
        ours,
        theirs,
        &labels,
    )
    .unwrap();
    let info = marked.conflict.unwrap();
    assert_eq!(
        info.base,
        MergeBase::NotAvailable(NoMergeBaseReason::NoCommonAncestor)
    );
}

#[test]
fn delete_versus_modify_keeps_the_surviving_side() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\n"), ("g", "keep\n")], "base");
    // ours deletes f, theirs rewrites it
    let ours = commit_with(&repo, vec![base], &[("g", "keep\n")], "ours");
    let theirs = commit_with(&repo, vec![base], &[("f", "new\n"), ("g", "keep\n")], "theirs");

    let labels = default_labels(&repo, ours, theirs).unwrap();
    let marked = merge_with_markers(
        &repo,
        MergeStrategy::Resolve,
        ConflictFormat::TwoWay,
        ours,
        theirs,
        &labels,
    )
    .unwrap();
    let info = marked.conflict.unwrap();
    assert_eq!(info.files, vec!["f".to_string()]);
    // The higher stage (the modification) survives, without markers.
    assert_eq!(tree_text(&repo, marked.tree, "f"), "new\n");
    assert_eq!(tree_text(&repo, marked.tree, "g"), "keep\n");
}

#[test]
fn criss_cross_needs_the_recursive_strategy() {
    let repo = MemoryRepository::new();
    let root = commit_with(&repo, vec![], &[("f", "a\nb\n")], "root");
    let x = commit_with(&repo, vec![root], &[("f", "x\nb\n")], "x");
    let y = commit_with(&repo, vec![root], &[("f", "a\ny\n")], "y");
    let xy = commit_with(&repo, vec![x, y], &[("f", "x\ny\n")], "xy");
    let yx = commit_with(&repo, vec![y, x], &[("f", "x\ny\n")], "yx");
    let ours = commit_with(&repo, vec![xy], &[("f", "x\ny\nours\n")], "ours");
    let theirs = commit_with(&repo, vec![yx], &[("f", "theirs\nx\ny\n")], "theirs");

    let err = merge_commits(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        ours,
        theirs,
        "msg",
    )
    .unwrap_err();
    assert!(matches!(err, MergeError::MultipleMergeBases { .. }));

    let merged = merge_commits(
        &repo,
        &ident("server"),
        MergeStrategy::Recursive,
        ours,
        theirs,
        "msg",
    )
    .unwrap();
    assert_eq!(file_text(&repo, merged, "f"), "theirs\nx\ny\nours\n");
}

#[test]
fn one_sided_strategies_take_one_tree_wholesale() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\n")], "base");
    let ours = commit_with(&repo, vec![base], &[("f", "x\n")], "ours");
    let theirs = commit_with(&repo, vec![base], &[("f", "y\n")], "theirs");

    let merged = merge_commits(
        &repo,
        &ident("server"),
        MergeStrategy::Ours,
        ours,
        theirs,
        "msg",
    )
    .unwrap();
    assert_eq!(file_text(&repo, merged, "f"), "x\n");

    let merged = merge_commits(
        &repo,
        &ident("server"),
        MergeStrategy::Theirs,
        ours,
        theirs,
        "msg",
    )
    .unwrap();
    assert_eq!(file_text(&repo, merged, "f"), "y\n");
}

#[test]
fn cherry_pick_reapplies_one_commit() {
    let repo = MemoryRepository::new();
    let root = commit_with(&repo, vec![], &[("f", "a\n"), ("g", "1\n")], "root");
    let pick = commit_with(&repo, vec![root], &[("f", "a\n"), ("g", "2\n")], "bump g");
    let onto = commit_with(&repo, vec![root], &[("f", "b\n"), ("g", "1\n")], "onto");

    let outcome = cherry_pick(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        onto,
        pick,
        &CherryPickOptions::default(),
    )
    .unwrap();
    assert!(outcome.conflict.is_none());
    assert_eq!(file_text(&repo, outcome.commit, "f"), "b\n");
    assert_eq!(file_text(&repo, outcome.commit, "g"), "2\n");
    let commit = repo.commit(&outcome.commit).unwrap();
    assert_eq!(commit.parents, vec![onto]);
    assert_eq!(commit.message, "bump g");
    assert_eq!(commit.author, ident("alice"));
    assert_eq!(commit.committer, ident("server"));
}

#[test]
fn cherry_pick_of_an_applied_change_reports_identical_tree() {
    let repo = MemoryRepository::new();
    let root = commit_with(&repo, vec![], &[("g", "1\n")], "root");
    let pick = commit_with(&repo, vec![root], &[("g", "2\n")], "bump g");
    // The target already has the picked content.
    let onto = commit_with(&repo, vec![root], &[("g", "2\n")], "same content");

    let err = cherry_pick(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        onto,
        pick,
        &CherryPickOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, MergeError::IdenticalTree));

    let opts = CherryPickOptions {
        ignore_identical_tree: true,
        ..CherryPickOptions::default()
    };
    let outcome = cherry_pick(&repo, &ident("server"), MergeStrategy::Resolve, onto, pick, &opts)
        .unwrap();
    assert_eq!(repo.commit(&outcome.commit).unwrap().parents, vec![onto]);
}

#[test]
fn cherry_pick_of_a_root_commit_fails() {
    let repo = MemoryRepository::new();
    let root = commit_with(&repo, vec![], &[("g", "1\n")], "root");
    let onto = commit_with(&repo, vec![], &[("g", "2\n")], "onto");
    let err = cherry_pick(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        onto,
        root,
        &CherryPickOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, MergeError::NoParentToPick));
}

#[test]
fn cherry_pick_can_keep_conflicts_as_markers() {
    let repo = MemoryRepository::new();
    let root = commit_with(&repo, vec![], &[("f", "a\n")], "root");
    let pick = commit_with(&repo, vec![root], &[("f", "picked\n")], "pick");
    let onto = commit_with(&repo, vec![root], &[("f", "target\n")], "onto");

    let strict = cherry_pick(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        onto,
        pick,
        &CherryPickOptions::default(),
    );
    assert!(matches!(strict, Err(MergeError::Conflict { .. })));

    let opts = CherryPickOptions {
        allow_conflicts: true,
        ..CherryPickOptions::default()
    };
    let outcome = cherry_pick(&repo, &ident("server"), MergeStrategy::Resolve, onto, pick, &opts)
        .unwrap();
    let info = outcome.conflict.unwrap();
    assert_eq!(info.files, vec!["f".to_string()]);
    assert_eq!(info.base, MergeBase::Commit(root));
    let text = file_text(&repo, outcome.commit, "f");
    assert!(text.contains("<<<<<<<"));
    assert!(text.contains("target\n"));
    assert!(text.contains("picked\n"));
}

#[test]
fn predicates_do_not_pollute_the_graph() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\nb\n")], "base");
    let ours = commit_with(&repo, vec![base], &[("f", "x\nb\n")], "ours");
    let clean = commit_with(&repo, vec![base], &[("f", "a\ny\n")], "clean");
    let dirty = commit_with(&repo, vec![base], &[("f", "z\nb\n")], "dirty");

    assert!(can_fast_forward(&repo, None, ours).unwrap());
    assert!(can_fast_forward(&repo, Some(base), ours).unwrap());
    assert!(!can_fast_forward(&repo, Some(ours), clean).unwrap());

    assert!(can_merge(&repo, MergeStrategy::Resolve, ours, clean).unwrap());
    assert!(!can_merge(&repo, MergeStrategy::Resolve, ours, dirty).unwrap());
    assert!(!can_merge(&repo, MergeStrategy::SimpleTwoWay, ours, clean).unwrap());

    assert!(can_cherry_pick(&repo, MergeStrategy::Resolve, ours, clean).unwrap());
    assert!(!can_cherry_pick(&repo, MergeStrategy::Resolve, ours, dirty).unwrap());

    let objects_before = [base, ours, clean, dirty];
    for id in objects_before {
        assert!(repo.contains(&id).unwrap());
    }
}

#[test]
fn queue_fast_forward_only_rejects_merges() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\n")], "base");
    let c1 = commit_with(&repo, vec![base], &[("f", "b\n")], "c1");
    let c2 = commit_with(&repo, vec![c1], &[("f", "c\n")], "c2");
    let side = commit_with(&repo, vec![base], &[("g", "s\n")], "side");

    let outcome = evaluate_queue(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        SubmitKind::FastForwardOnly,
        Some(base),
        &[c1, c2, side],
    )
    .unwrap();
    assert_eq!(outcome.tip, Some(c2));
    assert_eq!(outcome.statuses.get(&c1), Some(CommitMergeStatus::CleanFastForward));
    assert_eq!(outcome.statuses.get(&c2), Some(CommitMergeStatus::CleanFastForward));
    assert_eq!(outcome.statuses.get(&side), Some(CommitMergeStatus::NotFastForward));
}

#[test]
fn queue_merges_independent_candidates_past_a_conflict() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\n"), ("g", "1\n")], "base");
    let tip = commit_with(&repo, vec![base], &[("f", "tip\n"), ("g", "1\n")], "tip");
    let conflicting = commit_with(&repo, vec![base], &[("f", "boom\n"), ("g", "1\n")], "boom");
    let clean = commit_with(&repo, vec![base], &[("f", "a\n"), ("g", "2\n")], "clean");

    let outcome = evaluate_queue(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        SubmitKind::MergeIfNecessary,
        Some(tip),
        &[conflicting, clean],
    )
    .unwrap();
    assert_eq!(
        outcome.statuses.get(&conflicting),
        Some(CommitMergeStatus::PathConflict)
    );
    assert_eq!(outcome.statuses.conflicts(&conflicting), ["f".to_string()]);
    assert_eq!(outcome.statuses.get(&clean), Some(CommitMergeStatus::CleanMerge));
    let new_tip = outcome.tip.unwrap();
    assert_eq!(file_text(&repo, new_tip, "f"), "tip\n");
    assert_eq!(file_text(&repo, new_tip, "g"), "2\n");
}

#[test]
fn queue_flags_unscheduled_dependencies() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\n")], "base");
    let dep = commit_with(&repo, vec![base], &[("f", "b\n")], "dep");
    let child = commit_with(&repo, vec![dep], &[("f", "c\n")], "child");

    // `dep` is not in the queue, so `child` cannot land.
    let outcome = evaluate_queue(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        SubmitKind::MergeIfNecessary,
        Some(base),
        &[child],
    )
    .unwrap();
    assert_eq!(outcome.tip, Some(base));
    assert_eq!(
        outcome.statuses.get(&child),
        Some(CommitMergeStatus::MissingDependency)
    );
}

#[test]
fn queue_cherry_pick_rewrites_candidates_onto_the_tip() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\n"), ("g", "1\n")], "base");
    let tip = commit_with(&repo, vec![base], &[("f", "tip\n"), ("g", "1\n")], "tip");
    let candidate = commit_with(&repo, vec![base], &[("f", "a\n"), ("g", "2\n")], "bump g");

    let outcome = evaluate_queue(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        SubmitKind::CherryPick,
        Some(tip),
        &[candidate],
    )
    .unwrap();
    assert_eq!(outcome.statuses.get(&candidate), Some(CommitMergeStatus::CleanPick));
    let new_tip = outcome.tip.unwrap();
    let picked = repo.commit(&new_tip).unwrap();
    assert_eq!(picked.parents, vec![tip]);
    assert_eq!(file_text(&repo, new_tip, "f"), "tip\n");
    assert_eq!(file_text(&repo, new_tip, "g"), "2\n");
}

#[test]
fn queue_already_merged_candidates_are_skipped() {
    let repo = MemoryRepository::new();
    let base = commit_with(&repo, vec![], &[("f", "a\n")], "base");
    let tip = commit_with(&repo, vec![base], &[("f", "b\n")], "tip");

    let outcome = evaluate_queue(
        &repo,
        &ident("server"),
        MergeStrategy::Resolve,
        SubmitKind::MergeIfNecessary,
        Some(tip),
        &[base],
    )
    .unwrap();
    assert_eq!(outcome.tip, Some(tip));
    assert_eq!(outcome.statuses.get(&base), Some(CommitMergeStatus::AlreadyMerged));
}

proptest! {
    // Merging is a pure function of its inputs: repeating a merge of the
    // same commits always produces the identical tree.
    #[test]
    fn merging_is_deterministic(
        base_lines in proptest::collection::vec("[ab]", 0..8),
        ours_lines in proptest::collection::vec("[abx]", 0..8),
        theirs_lines in proptest::collection::vec("[aby]", 0..8),
    ) {
        let repo = MemoryRepository::new();
        let join = |lines: &[String]| {
            lines.iter().map(|l| format!("{l}\n")).collect::<String>()
        };
        let base = commit_with(&repo, vec![], &[("f", &join(&base_lines))], "base");
        let ours = commit_with(&repo, vec![base], &[("f", &join(&ours_lines))], "ours");
        let theirs = commit_with(&repo, vec![base], &[("f", &join(&theirs_lines))], "theirs");

        let labels = default_labels(&repo, ours, theirs).unwrap();
        let first = merge_with_markers(
            &repo, MergeStrategy::Resolve, ConflictFormat::TwoWay, ours, theirs, &labels,
        ).unwrap();
        let second = merge_with_markers(
            &repo, MergeStrategy::Resolve, ConflictFormat::TwoWay, ours, theirs, &labels,
        ).unwrap();
        prop_assert_eq!(first.tree, second.tree);
        prop_assert_eq!(
            first.conflict.map(|c| c.files),
            second.conflict.map(|c| c.files)
        );
    }
}

// Integration tests for capturing and replaying patches against files on disk.

use std::fs;
use std::path::Path;

use openapi_sync_core::error::PatchError;
use openapi_sync_core::patch::{apply_to_text, capture, PatchApplier, PatchDocument};
use tempfile::tempdir;

fn numbered(count: usize) -> String {
    (1..=count).map(|i| format!("line {i}\n")).collect()
}

fn edited(text: &str, line: usize, replacement: &str) -> String {
    text.lines()
        .enumerate()
        .map(|(i, l)| {
            if i + 1 == line {
                format!("{replacement}\n")
            } else {
                format!("{l}\n")
            }
        })
        .collect()
}

fn padding(count: usize) -> String {
    (0..count).map(|i| format!("drift {i}\n")).collect()
}

fn no_backups_left(dir: &Path) -> bool {
    fs::read_dir(dir)
        .unwrap()
        .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".backup"))
}

#[test]
fn captured_patch_reproduces_the_edit() {
    let before = numbered(30);
    let after = edited(&before, 15, "line fifteen");
    let patch = capture("doc.txt", &before, &after).unwrap();

    let result = apply_to_text(&before, &patch.hunks, 3).unwrap();
    assert_eq!(result.text, after);
    assert_eq!(result.applied, 1);

    // The persisted form parses back to the same hunks.
    let reparsed = PatchDocument::parse(&patch.render()).unwrap();
    assert_eq!(reparsed, patch);
}

#[test]
fn identical_texts_capture_nothing() {
    let text = numbered(5);
    assert!(capture("doc.txt", &text, &text).is_none());
}

#[test]
fn drift_within_fuzz_applies_and_beyond_fuzz_leaves_file_untouched() {
    struct Case {
        drift: usize,
        applies: bool,
    }
    let cases = vec![
        Case {
            drift: 0,
            applies: true,
        },
        Case {
            drift: 1,
            applies: true,
        },
        Case {
            drift: 3,
            applies: true,
        },
        Case {
            drift: 4,
            applies: false,
        },
        Case {
            drift: 9,
            applies: false,
        },
    ];

    let before = numbered(30);
    let after = edited(&before, 15, "line fifteen");
    let patch = capture("doc.txt", &before, &after).unwrap();

    for case in cases {
        let dir = tempdir().unwrap();
        let target = dir.path().join("doc.txt");
        let original = format!("{}{}", padding(case.drift), before);
        fs::write(&target, &original).unwrap();

        let result = PatchApplier::new(dir.path(), 3).apply(&patch);
        let on_disk = fs::read_to_string(&target).unwrap();
        if case.applies {
            let report = result.unwrap_or_else(|e| panic!("drift {}: {e}", case.drift));
            assert_eq!(report.applied, 1);
            assert_eq!(on_disk, format!("{}{}", padding(case.drift), after));
        } else {
            match result {
                Err(PatchError::HunkNotFound(err)) => {
                    assert_eq!(err.hunk, 1);
                    assert_eq!(err.fuzz, 3);
                    let nearest = err
                        .nearest
                        .expect("a full-context candidate exists further away");
                    assert_eq!(nearest.matching_lines, nearest.total_lines);
                    assert_eq!(nearest.line, 12 + case.drift);
                }
                other => panic!("drift {}: expected hunk-not-found, got {other:?}", case.drift),
            }
            assert_eq!(on_disk, original, "drift {}: file must be byte-identical", case.drift);
        }
        assert!(no_backups_left(dir.path()));
    }
}

#[test]
fn drifted_anchor_wins_over_a_nearer_copy_of_the_result() {
    let patch =
        PatchDocument::parse("--- doc.txt\n+++ doc.txt\n@@ -3,3 +3,2 @@\n a\n-x\n b\n").unwrap();

    // Lines 1-2 already read like the edited block; the real anchor drifted
    // two lines down and must still be edited.
    let result = apply_to_text("a\nb\np\nq\na\nx\nb\n", &patch.hunks, 3).unwrap();
    assert_eq!(result.applied, 1);
    assert_eq!(result.already_applied, 0);
    assert_eq!(result.text, "a\nb\np\nq\na\nb\n");

    // With the anchor gone the nearer copy counts as already applied.
    let again = apply_to_text(&result.text, &patch.hunks, 3).unwrap();
    assert_eq!(again.applied, 0);
    assert_eq!(again.already_applied, 1);
    assert_eq!(again.text, result.text);
}

#[test]
fn drift_is_carried_from_one_hunk_to_the_next() {
    let before = numbered(60);
    let after = edited(&edited(&before, 10, "line ten"), 50, "line fifty");
    let patch = capture("doc.txt", &before, &after).unwrap();
    assert_eq!(patch.hunks.len(), 2);

    // Three lines of drift before the first hunk and three more between the
    // hunks: the second hunk sits six lines away from its header.
    let drifted_before: String = format!(
        "{}{}{}{}",
        padding(3),
        numbered(30),
        padding(3),
        (31..=60).map(|i| format!("line {i}\n")).collect::<String>()
    );
    let result = apply_to_text(&drifted_before, &patch.hunks, 3).unwrap();
    assert_eq!(result.applied, 2);
    assert!(result.text.contains("line ten\n"));
    assert!(result.text.contains("line fifty\n"));
}

#[test]
fn reapplying_a_patch_is_a_noop() {
    let dir = tempdir().unwrap();
    let before = numbered(20);
    let after = edited(&before, 8, "line eight");
    fs::write(dir.path().join("doc.txt"), &before).unwrap();
    let patch = capture("doc.txt", &before, &after).unwrap();
    let applier = PatchApplier::new(dir.path(), 3);

    let first = applier.apply(&patch).unwrap();
    assert_eq!((first.applied, first.already_applied, first.files.len()), (1, 0, 1));

    let second = applier.apply(&patch).unwrap();
    assert!(second.is_noop());
    assert_eq!((second.applied, second.already_applied), (0, 1));
    assert!(second.files.is_empty());
    assert_eq!(fs::read_to_string(dir.path().join("doc.txt")).unwrap(), after);
}

#[test]
fn failure_in_one_file_leaves_every_file_untouched() {
    let dir = tempdir().unwrap();
    let a_before = numbered(10);
    let b_before = numbered(10);
    let mut patch = capture("a.txt", &a_before, &edited(&a_before, 5, "changed a")).unwrap();
    patch
        .hunks
        .extend(capture("b.txt", &b_before, &edited(&b_before, 5, "changed b")).unwrap().hunks);

    fs::write(dir.path().join("a.txt"), &a_before).unwrap();
    let unrelated = "something else entirely\n";
    fs::write(dir.path().join("b.txt"), unrelated).unwrap();

    let err = PatchApplier::new(dir.path(), 3).apply(&patch).unwrap_err();
    match err {
        PatchError::HunkNotFound(e) => {
            assert_eq!(e.path, "b.txt");
            assert_eq!(e.hunk, 2);
        }
        other => panic!("expected hunk-not-found, got {other:?}"),
    }
    assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), a_before);
    assert_eq!(fs::read_to_string(dir.path().join("b.txt")).unwrap(), unrelated);
    assert!(no_backups_left(dir.path()));
}

#[test]
fn yaml_targets_must_still_parse() {
    let dir = tempdir().unwrap();
    let before = "a: 1\nb: 2\n";
    let broken = "a: 1\nb: [unclosed\n";
    fs::write(dir.path().join("doc.yaml"), before).unwrap();
    let patch = capture("doc.yaml", before, broken).unwrap();

    let err = PatchApplier::new(dir.path(), 3).apply(&patch).unwrap_err();
    assert!(matches!(err, PatchError::InvalidResult { .. }));
    assert_eq!(fs::read_to_string(dir.path().join("doc.yaml")).unwrap(), before);
}

#[test]
fn missing_target_is_reported() {
    let dir = tempdir().unwrap();
    let patch = capture("absent.txt", "a\n", "b\n").unwrap();
    let err = PatchApplier::new(dir.path(), 3).apply(&patch).unwrap_err();
    assert!(matches!(err, PatchError::MissingTarget(_)));
}

#[test]
fn git_style_patch_applies_after_normalisation() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("api")).unwrap();
    fs::write(
        dir.path().join("api/openapi.yaml"),
        "info:\n  title: Demo\n  version: 1.0.0\npaths: {}\n",
    )
    .unwrap();

    let raw = "\
diff --git a/api/openapi.yaml b/api/openapi.yaml
index 1111111..2222222 100644
--- a/api/openapi.yaml
+++ b/api/openapi.yaml
@@ -1,4 +1,5 @@
 info:
   title: Demo
   version: 1.0.0
+  description: patched
 paths: {}
";
    let patch = PatchDocument::parse(&openapi_sync_core::patch::normalize_prefixes(raw)).unwrap();
    PatchApplier::new(dir.path(), 3).apply(&patch).unwrap();
    assert_eq!(
        fs::read_to_string(dir.path().join("api/openapi.yaml")).unwrap(),
        "info:\n  title: Demo\n  version: 1.0.0\n  description: patched\npaths: {}\n"
    );
}

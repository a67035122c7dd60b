//! Property-style checks for the lexical similarity metric.

use hybrid_tm::match_quality::similarity;

#[test]
fn identity_on_a_corpus_of_segments() {
    let segments = [
        "Save settings",
        "The quick brown fox jumps over the lazy dog",
        "¿Dónde está la biblioteca?",
        "a",
        "Multi\nline\nsegment",
        "   padded   ",
    ];
    for segment in segments {
        assert_eq!(similarity(segment, segment), 100, "{segment:?}");
    }
}

#[test]
fn symmetry_on_a_corpus_of_pairs() {
    let pairs = [
        ("Save settings", "Save the settings now"),
        ("Open file", "Close file"),
        ("Hello world", "world Hello"),
        ("abcabc", "bcabca"),
        ("short", "much longer sentence entirely"),
        ("Straße", "Strasse"),
    ];
    for (x, y) in pairs {
        assert_eq!(similarity(x, y), similarity(y, x), "{x:?} vs {y:?}");
    }
}

#[test]
fn empty_against_non_empty_is_zero() {
    for other in ["y", "longer text", " "] {
        assert_eq!(similarity("", other), 0);
        assert_eq!(similarity(other, ""), 0);
    }
}

#[test]
fn scores_stay_in_range() {
    let samples = [
        ("", ""),
        ("x", "x"),
        ("x", "y"),
        ("Save settings", "Save the settings now"),
        ("aaaa", "aaaaaaaaaaaaaaaaaaaaaaaa"),
        ("1234567890", "0987654321"),
    ];
    for (x, y) in samples {
        let score = similarity(x, y);
        assert!(score <= 100, "{x:?} vs {y:?} -> {score}");
    }
}

#[test]
fn partial_overlap_is_strictly_between_extremes() {
    let exact = similarity("Save settings", "Save settings");
    let close = similarity("Save settings", "Save the settings now");
    let far = similarity("Save settings", "Completely different text");

    assert_eq!(exact, 100);
    assert!(close > far, "close={close} far={far}");
    assert!(close < exact, "close={close}");
}

#[test]
fn more_overlap_scores_higher() {
    let query = "Please save the current settings";
    let near = similarity(query, "Please save the settings");
    let mid = similarity(query, "save settings");
    let far = similarity(query, "quarterly revenue report");

    assert!(near > mid, "near={near} mid={mid}");
    assert!(mid > far, "mid={mid} far={far}");
}

#[test]
fn whitespace_only_differences_do_not_matter_at_the_edges() {
    assert_eq!(
        similarity("  Save settings", "Save settings  "),
        100
    );
}

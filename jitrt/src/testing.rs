//! Helpers shared by the crate's unit tests.

use fm::{FMBuilder, FMatcher};
use regex::Regex;
use std::sync::OnceLock;

/// Build an [fm] matcher for `ptn` where `{{.+?}}` matches a name: two patterns with the same
/// name must match the same literal text.
pub(crate) fn fmatcher(ptn: &str) -> FMatcher<'_> {
    // The regexes are compiled once and cloned for each matcher, as sharing them between test
    // threads involves locking.
    static PTN_RE: OnceLock<Regex> = OnceLock::new();
    static LITERAL_RE: OnceLock<Regex> = OnceLock::new();
    let ptn_re = PTN_RE
        .get_or_init(|| Regex::new(r"\{\{.+?\}\}").unwrap())
        .clone();
    let literal_re = LITERAL_RE
        .get_or_init(|| Regex::new(r"[a-zA-Z0-9\._]+").unwrap())
        .clone();
    FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(ptn_re, literal_re)
        .build()
        .unwrap()
}

/// Assert that `text` matches the [fmatcher] pattern `ptn`, printing both if it doesn't.
pub(crate) fn assert_matches(ptn: &str, text: &str) {
    if let Err(e) = fmatcher(ptn).matches(text) {
        panic!("{e}");
    }
}

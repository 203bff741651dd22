//! Review verdict parsing.
//!
//! The parser gates pipeline progress, so its behavior is fixed and
//! documented here. Two passes over the review transcript:
//!
//! 1. **Explicit header**: a line `レビュー結果: APPROVED` /
//!    `CHANGES_REQUESTED` / `COMMENTED` wins outright.
//! 2. **Keyword fallback**: any change-request keyword forces
//!    CHANGES_REQUESTED; otherwise any approval keyword forces APPROVED;
//!    otherwise the configured default applies. The shipped default is
//!    APPROVED, matching the original system, which approves even a
//!    transcript that matched nothing.

use crate::task::ReviewVerdict;

/// Keywords that force CHANGES_REQUESTED in the fallback pass.
const CHANGE_KEYWORDS: &[&str] = &[
    "修正が必要",
    "修正してください",
    "要修正",
    "変更が必要",
    "改善が必要",
    "やり直し",
    "must be fixed",
    "needs changes",
    "changes required",
];

/// Keywords that force APPROVED in the fallback pass.
const APPROVE_KEYWORDS: &[&str] = &[
    "承認します",
    "承認",
    "問題ありません",
    "LGTM",
    "looks good",
    "approved",
];

/// Parse a verdict from the review transcript.
pub fn parse_verdict(text: &str, default: ReviewVerdict) -> ReviewVerdict {
    // Pass 1: explicit header.
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("レビュー結果:") {
            match rest.trim() {
                "APPROVED" => return ReviewVerdict::Approved,
                "CHANGES_REQUESTED" => return ReviewVerdict::ChangesRequested,
                "COMMENTED" => return ReviewVerdict::Commented,
                _ => {}
            }
        }
    }

    // Pass 2: keyword fallback. Change-request keywords take precedence.
    if CHANGE_KEYWORDS.iter().any(|k| text.contains(k)) {
        return ReviewVerdict::ChangesRequested;
    }
    if APPROVE_KEYWORDS.iter().any(|k| text.contains(k)) {
        return ReviewVerdict::Approved;
    }

    default
}

/// Extract reviewer comments: bullet lines (`- ` / `* `) in transcript
/// order, with the verdict header line excluded.
pub fn parse_comments(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("レビュー結果:"))
        .filter_map(|line| {
            line.strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .map(|c| c.trim().to_string())
        })
        .filter(|c| !c.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_header_wins() {
        let text = "調査しました。\nレビュー結果: CHANGES_REQUESTED\n- Add test";
        assert_eq!(
            parse_verdict(text, ReviewVerdict::Approved),
            ReviewVerdict::ChangesRequested
        );
    }

    #[test]
    fn header_beats_keywords() {
        // Header says approved even though a change keyword appears later.
        let text = "レビュー結果: APPROVED\n以前は修正が必要でしたが対応済みです。";
        assert_eq!(
            parse_verdict(text, ReviewVerdict::Commented),
            ReviewVerdict::Approved
        );
    }

    #[test]
    fn commented_header_parses() {
        let text = "レビュー結果: COMMENTED\n- Consider renaming";
        assert_eq!(
            parse_verdict(text, ReviewVerdict::Approved),
            ReviewVerdict::Commented
        );
    }

    #[test]
    fn change_keyword_forces_changes_requested() {
        let text = "このままでは使えません。修正が必要です。";
        assert_eq!(
            parse_verdict(text, ReviewVerdict::Approved),
            ReviewVerdict::ChangesRequested
        );
    }

    #[test]
    fn change_keyword_beats_approve_keyword() {
        let text = "全体としてはLGTMですが、テストは修正が必要です。";
        assert_eq!(
            parse_verdict(text, ReviewVerdict::Approved),
            ReviewVerdict::ChangesRequested
        );
    }

    #[test]
    fn approve_keyword_forces_approved() {
        let text = "問題ありません。マージして大丈夫です。";
        assert_eq!(
            parse_verdict(text, ReviewVerdict::Commented),
            ReviewVerdict::Approved
        );
    }

    #[test]
    fn default_applies_when_nothing_matches() {
        let text = "なんとも言えない内容です。";
        assert_eq!(parse_verdict(text, ReviewVerdict::Approved), ReviewVerdict::Approved);
        assert_eq!(parse_verdict(text, ReviewVerdict::Commented), ReviewVerdict::Commented);
    }

    #[test]
    fn comments_are_bullets_in_order() {
        let text = "レビュー結果: CHANGES_REQUESTED\n\
                    - Add test\n\
                    説明文\n\
                    * Fix naming\n\
                    -not a bullet";
        assert_eq!(parse_comments(text), vec!["Add test", "Fix naming"]);
    }

    #[test]
    fn comments_empty_when_no_bullets() {
        assert!(parse_comments("レビュー結果: APPROVED").is_empty());
    }
}

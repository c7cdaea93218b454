//! Core domain model and post formatting for dfbugs.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dfbugs-core";

/// One row of the bug tracker CSV export, as persisted locally.
///
/// `id` is the tracker's stable external identifier and the primary key of
/// the local store. All other fields are overwritten wholesale on every
/// re-observation; `date_submitted` keeps the tracker's own date string
/// verbatim and is never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugRecord {
    pub id: String,
    pub summary: String,
    pub status: String,
    pub category: String,
    pub resolution: String,
    pub severity: String,
    pub date_submitted: String,
}

/// Canonical URL of a bug's tracker page.
pub fn bug_view_url(tracker_base: &str, id: &str) -> String {
    format!("{}/view.php?id={}", tracker_base.trim_end_matches('/'), id)
}

/// Byte-range link annotation over a post's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkFacet {
    pub byte_start: usize,
    pub byte_end: usize,
    pub uri: String,
}

/// Post text plus rich-text link annotations.
///
/// Built incrementally so facet ranges always match the final byte offsets
/// of the text they annotate. The target medium rejects posts whose facet
/// ranges drift from the actual URL substring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostText {
    text: String,
    facets: Vec<LinkFacet>,
}

impl PostText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, segment: &str) -> &mut Self {
        self.text.push_str(segment);
        self
    }

    /// Append `uri` as visible text covered by a link facet.
    pub fn push_link(&mut self, uri: &str) -> &mut Self {
        let byte_start = self.text.len();
        self.text.push_str(uri);
        self.facets.push(LinkFacet {
            byte_start,
            byte_end: self.text.len(),
            uri: uri.to_string(),
        });
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn facets(&self) -> &[LinkFacet] {
        &self.facets
    }
}

/// Format a bug for publishing: summary, blank line, clickable tracker link.
pub fn format_bug_post(bug: &BugRecord, tracker_base: &str) -> PostText {
    let mut post = PostText::new();
    post.push_text(&bug.summary)
        .push_text("\n\n")
        .push_link(&bug_view_url(tracker_base, &bug.id));
    post
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_bug(id: &str, summary: &str) -> BugRecord {
        BugRecord {
            id: id.to_string(),
            summary: summary.to_string(),
            status: "new".to_string(),
            category: "General".to_string(),
            resolution: "open".to_string(),
            severity: "minor".to_string(),
            date_submitted: "2020-01-01".to_string(),
        }
    }

    #[test]
    fn view_url_tolerates_trailing_slash() {
        assert_eq!(
            bug_view_url("https://tracker.example/", "42"),
            "https://tracker.example/view.php?id=42"
        );
        assert_eq!(
            bug_view_url("https://tracker.example", "42"),
            "https://tracker.example/view.php?id=42"
        );
    }

    #[test]
    fn facet_range_covers_exactly_the_url() {
        for id in ["1", "123456"] {
            let bug = mk_bug(id, "Dwarves cancel task: interrupted by bird");
            let post = format_bug_post(&bug, "https://tracker.example");
            let url = bug_view_url("https://tracker.example", id);

            assert_eq!(post.facets().len(), 1);
            let facet = &post.facets()[0];
            assert_eq!(&post.text()[facet.byte_start..facet.byte_end], url);
            assert_eq!(facet.uri, url);
            assert_eq!(facet.byte_end, post.text().len());
        }
    }

    #[test]
    fn post_text_is_summary_blank_line_url() {
        let bug = mk_bug("7", "Cats adopt owners");
        let post = format_bug_post(&bug, "https://tracker.example");
        assert_eq!(
            post.text(),
            "Cats adopt owners\n\nhttps://tracker.example/view.php?id=7"
        );
    }

    #[test]
    fn multibyte_summary_keeps_byte_offsets_honest() {
        let bug = mk_bug("9", "Engraving of a dwarf \u{2014} masterfully designed");
        let post = format_bug_post(&bug, "https://tracker.example");
        let facet = &post.facets()[0];
        assert_eq!(
            &post.text()[facet.byte_start..facet.byte_end],
            "https://tracker.example/view.php?id=9"
        );
    }
}

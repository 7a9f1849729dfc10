//! Mechanical citation verification.
//!
//! A zero-cost, LLM-free structural check run after a terminal answer:
//! every `[doc N]` reference must name a document that exists, and every
//! quoted string attributed to a document must appear in it verbatim.
//! Failures annotate the result; they never block answer delivery.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::document::Document;

#[allow(clippy::expect_used)]
static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[doc\s+(\d+)\]").expect("citation pattern is valid"));

// A quoted span directly attributed to a document: "..." [doc N]. Short
// quotes are skipped; they collide with ordinary punctuation too often.
#[allow(clippy::expect_used)]
static QUOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([^"]{12,}?)"\s*\[doc\s+(\d+)\]"#).expect("quote pattern is valid")
});

/// A document citation found in an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub doc_id: usize,
    pub found: bool,
}

/// A quoted string attributed to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub text: String,
    pub doc_id: usize,
    pub found: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub citations: Vec<Citation>,
    pub quotes: Vec<Quote>,
}

impl VerificationReport {
    /// True when every citation and quote was found.
    pub fn all_valid(&self) -> bool {
        self.citations.iter().all(|c| c.found) && self.quotes.iter().all(|q| q.found)
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} citations valid, {}/{} quotes valid",
            self.citations.iter().filter(|c| c.found).count(),
            self.citations.len(),
            self.quotes.iter().filter(|q| q.found).count(),
            self.quotes.len(),
        )
    }
}

/// Check an answer's `[doc N]` citations and attributed quotes against the
/// session's input set. Document ids are zero-based `context` indices.
pub fn verify_answer(answer: &str, documents: &[Document]) -> VerificationReport {
    let mut report = VerificationReport::default();

    for captures in CITATION.captures_iter(answer) {
        let Ok(doc_id) = captures[1].parse::<usize>() else {
            continue;
        };
        report.citations.push(Citation {
            doc_id,
            found: doc_id < documents.len(),
        });
    }

    for captures in QUOTE.captures_iter(answer) {
        let text = captures[1].to_string();
        let Ok(doc_id) = captures[2].parse::<usize>() else {
            continue;
        };
        let found = documents
            .get(doc_id)
            .is_some_and(|doc| doc.content.contains(&text));
        report.quotes.push(Quote { text, doc_id, found });
    }

    report
}

//! Text classification of assistant responses.
//!
//! Indicator phrases are data, compiled into case-insensitive [`RegexSet`]s.
//! When a response matches both sets, **failure wins**: a reply that says
//! "task completed successfully" and also "error: tests failed" is a failure.

use anyhow::{Context, Result};
use regex::{RegexSet, RegexSetBuilder};

/// Classification of the response text received so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// A failure indicator matched; carries the matching phrase.
    Failure { indicator: String },
    /// Neither indicator set matched yet.
    Pending,
}

impl Verdict {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Strategy deciding whether response text signals completion.
pub trait CompletionClassifier: Send + Sync {
    fn classify(&self, response: &str) -> Verdict;
}

pub const DEFAULT_SUCCESS_INDICATORS: &[&str] = &[
    "task completed successfully",
    "task completed",
    "task is complete",
    "implementation complete",
    "successfully implemented",
    "all tests pass",
    "all tests are passing",
];

pub const DEFAULT_FAILURE_INDICATORS: &[&str] = &[
    "task failed",
    "unable to complete",
    "could not complete",
    "cannot complete",
    "error:",
    "tests failed",
    "compilation failed",
];

/// Phrase-matching classifier with failure-first precedence.
#[derive(Debug, Clone)]
pub struct IndicatorClassifier {
    success: RegexSet,
    failure: RegexSet,
    failure_phrases: Vec<String>,
}

impl IndicatorClassifier {
    pub fn new<S: AsRef<str>>(success: &[S], failure: &[S]) -> Result<Self> {
        let (success, _) = compile(success).context("compile success indicators")?;
        let (failure, failure_phrases) = compile(failure).context("compile failure indicators")?;
        Ok(Self {
            success,
            failure,
            failure_phrases,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_SUCCESS_INDICATORS, DEFAULT_FAILURE_INDICATORS)
    }
}

impl CompletionClassifier for IndicatorClassifier {
    fn classify(&self, response: &str) -> Verdict {
        if let Some(idx) = self.failure.matches(response).iter().next() {
            let indicator = self.failure_phrases.get(idx).cloned().unwrap_or_default();
            return Verdict::Failure { indicator };
        }
        if self.success.is_match(response) {
            return Verdict::Success;
        }
        Verdict::Pending
    }
}

/// Compile non-blank phrases; returns the set and the phrases in pattern order.
fn compile<S: AsRef<str>>(phrases: &[S]) -> Result<(RegexSet, Vec<String>)> {
    let kept: Vec<String> = phrases
        .iter()
        .map(|phrase| phrase.as_ref().trim().to_string())
        .filter(|phrase| !phrase.is_empty())
        .collect();
    let set = RegexSetBuilder::new(kept.iter().map(|phrase| regex::escape(phrase)))
        .case_insensitive(true)
        .build()?;
    Ok((set, kept))
}

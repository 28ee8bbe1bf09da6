//! Command-line classification: which source file is this child building?
//!
//! The gate and the walker both need to turn an argument vector (or a
//! `/proc/<pid>/cmdline` buffer) into a profile key.  The heuristic is
//! deliberately dumb: the *last* token that looks like a source file path
//! wins.  Compiler drivers put the input file after the flags, and the
//! tokens that could fool us (`-DNAME=foo.c`, bare `conftest.c`) are
//! excluded by requiring a directory separator.

use crate::internal_prelude::*;

/// The classification rules: which suffixes mark a source file.
///
/// Derived from the configuration once at startup and shared by the gate
/// and the walker.
#[derive(Debug, Clone)]
pub(crate) struct ClassifyRules {
    /// Recognized suffixes, each beginning with a dot.
    suffixes: Arc<[Box<str>]>,
}

impl ClassifyRules {
    /// Build rules from a configuration.
    pub(crate) fn from_config(config: &Config) -> Self {
        ClassifyRules {
            suffixes: config.source_suffixes.clone().into(),
        }
    }

    /// Classify an argument vector (or pre-split command line).
    ///
    /// Keeps the last token that ends in a recognized suffix and still
    /// contains a directory separator once its leading `../` segments are
    /// stripped; the stripped form is the profile key.  Returns `None`
    /// when no token qualifies.
    ///
    /// Total and idempotent: classifying a previously-returned key yields
    /// that key again.
    pub(crate) fn classify<'t, I>(&self, tokens: I) -> Option<String>
    where
        I: IntoIterator<Item = &'t str>,
    {
        let mut winner = None;
        for token in tokens {
            // A stray opening quote is a token boundary too: recipe text
            // reaches us unevaluated often enough to matter.
            let token = token.strip_prefix('"').unwrap_or(token);
            if !self.has_source_suffix(token) {
                continue;
            }
            let stripped = strip_dotdot(token);
            if !stripped.contains('/') {
                continue;
            }
            // Last candidate in token order wins.
            winner = Some(stripped);
        }
        winner.map(str::to_owned)
    }

    /// Classify a flat command-line string, splitting on shell-word
    /// separators.
    pub(crate) fn classify_str(&self, cmdline: &str) -> Option<String> {
        self.classify(cmdline.split_whitespace())
    }

    /// Does this token end in one of the recognized suffixes?
    fn has_source_suffix(&self, token: &str) -> bool {
        self.suffixes.iter().any(|sfx| token.ends_with(&**sfx))
    }
}

/// Strip every leading `../` segment, so the same file compiled from
/// different invocation directories collapses to one profile key.
fn strip_dotdot(mut path: &str) -> &str {
    while let Some(rest) = path.strip_prefix("../") {
        path = rest;
    }
    path
}

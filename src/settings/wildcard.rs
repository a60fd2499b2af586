//! Address wildcard matching.
//!
//! Addresses are dotted word sequences (`add.addressA`). Patterns may use:
//! - `*` matches exactly one word
//! - `#` matches zero or more trailing words (must be the last word)
//!
//! Patterns are ordered by specificity so the settings repository can merge
//! overlapping matches from most to least specific.

use crate::settings::ConfigError;
use std::cmp::Ordering;
use std::fmt;

/// Word separator in addresses and patterns.
pub const DELIMITER: char = '.';
/// Matches exactly one word.
pub const SINGLE_WORD: &str = "*";
/// Matches any number of trailing words, including none.
pub const ANY_WORDS: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Word {
    Literal(String),
    Single,
    Any,
}

impl Word {
    fn rank(&self) -> u8 {
        match self {
            Word::Literal(_) => 2,
            Word::Single => 1,
            Word::Any => 0,
        }
    }
}

/// A parsed match pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    raw: String,
    words: Vec<Word>,
}

impl Pattern {
    /// Parse and validate a pattern.
    ///
    /// `#` is only legal as the final word and empty words (`a..b`) are
    /// rejected. The empty pattern is legal and matches only the empty
    /// address.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut words = Vec::new();
        let tokens = split(raw);
        let last = tokens.len().saturating_sub(1);
        for (idx, token) in tokens.into_iter().enumerate() {
            let word = match token {
                "" => {
                    return Err(ConfigError::IllegalPattern {
                        pattern: raw.to_string(),
                        reason: "empty word".into(),
                    })
                }
                SINGLE_WORD => Word::Single,
                ANY_WORDS if idx == last => Word::Any,
                ANY_WORDS => {
                    return Err(ConfigError::IllegalPattern {
                        pattern: raw.to_string(),
                        reason: format!("'{ANY_WORDS}' must be the last word"),
                    })
                }
                literal => Word::Literal(literal.to_string()),
            };
            words.push(word);
        }
        Ok(Self {
            raw: raw.to_string(),
            words,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern contains no wildcard words.
    pub fn is_concrete(&self) -> bool {
        self.words.iter().all(|w| matches!(w, Word::Literal(_)))
    }

    pub fn literal_count(&self) -> usize {
        self.words
            .iter()
            .filter(|w| matches!(w, Word::Literal(_)))
            .count()
    }

    pub fn has_any_words(&self) -> bool {
        matches!(self.words.last(), Some(Word::Any))
    }

    /// Number of leading literal words.
    pub fn literal_prefix_len(&self) -> usize {
        self.words
            .iter()
            .take_while(|w| matches!(w, Word::Literal(_)))
            .count()
    }

    pub fn matches(&self, address: &str) -> bool {
        let parts = split(address);
        for (idx, word) in self.words.iter().enumerate() {
            match word {
                Word::Any => return true,
                Word::Single => {
                    if idx >= parts.len() {
                        return false;
                    }
                }
                Word::Literal(literal) => {
                    if parts.get(idx).map_or(true, |part| *part != literal) {
                        return false;
                    }
                }
            }
        }
        self.words.len() == parts.len()
    }

    /// Compare two patterns by specificity. `Greater` means `self` is more
    /// specific.
    ///
    /// Keys, in order: more literal words, no `#`, longer literal prefix.
    /// Remaining ties compare word ranks position by position (literal over
    /// `*` over `#`), then fewer words, then the raw strings in reverse
    /// lexical order so that only identical patterns compare equal.
    pub fn compare_specificity(&self, other: &Self) -> Ordering {
        self.literal_count()
            .cmp(&other.literal_count())
            .then_with(|| other.has_any_words().cmp(&self.has_any_words()))
            .then_with(|| self.literal_prefix_len().cmp(&other.literal_prefix_len()))
            .then_with(|| {
                for (a, b) in self.words.iter().zip(other.words.iter()) {
                    let ord = a.rank().cmp(&b.rank());
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            })
            .then_with(|| other.words.len().cmp(&self.words.len()))
            .then_with(|| other.raw.cmp(&self.raw))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split(value: &str) -> Vec<&str> {
    if value.is_empty() {
        Vec::new()
    } else {
        value.split(DELIMITER).collect()
    }
}

/// Check whether `pattern` matches `address`. Illegal patterns never match.
pub fn matches(pattern: &str, address: &str) -> bool {
    Pattern::parse(pattern).is_ok_and(|p| p.matches(address))
}

/// Specificity comparison over raw pattern strings.
pub fn compare_specificity(a: &str, b: &str) -> Result<Ordering, ConfigError> {
    Ok(Pattern::parse(a)?.compare_specificity(&Pattern::parse(b)?))
}

//! Glob patterns over archive entry names.
//!
//! - `*` matches zero or more characters within one path segment
//! - `?` matches exactly one character other than `/`
//! - `**` matches across segments; `**/` matches zero or more directories
//! - `[abc]`, `[a-z]` and `[!a]` match one character from (or outside) a set
//!
//! A pattern without `/` is matched against the final path component, so
//! `*.txt` selects text files at any depth.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    Star,
    GlobStar,
    /// `**/`: empty, or any run of characters ending in `/`
    GlobStarSlash,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

/// A compiled glob pattern
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    tokens: Vec<Token>,
    basename_only: bool,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let chars: Vec<char> = pattern.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '*' if chars.get(i + 1) == Some(&'*') => {
                    // runs like `***` collapse into one globstar
                    let run = chars[i..].iter().take_while(|&&c| c == '*').count();
                    i += run;
                    if chars.get(i) == Some(&'/') {
                        tokens.push(Token::GlobStarSlash);
                        i += 1;
                    } else {
                        tokens.push(Token::GlobStar);
                    }
                }
                '*' => {
                    tokens.push(Token::Star);
                    i += 1;
                }
                '?' => {
                    tokens.push(Token::AnyChar);
                    i += 1;
                }
                '[' => {
                    let (token, next) = parse_class(&chars, i).ok_or_else(|| {
                        Error::InvalidArgument(format!("unterminated character class in {pattern:?}"))
                    })?;
                    tokens.push(token);
                    i = next;
                }
                c => {
                    tokens.push(Token::Literal(c));
                    i += 1;
                }
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            tokens,
            basename_only: !pattern.contains('/'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `name` matches this pattern
    pub fn matches(&self, name: &str) -> bool {
        let subject = if self.basename_only {
            basename(name)
        } else {
            name
        };
        let text: Vec<char> = subject.chars().collect();
        match_tokens(&self.tokens, &text)
    }
}

/// Final path component, ignoring a trailing directory separator
pub(crate) fn basename(name: &str) -> &str {
    let trimmed = name.strip_suffix('/').unwrap_or(name);
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn parse_class(chars: &[char], start: usize) -> Option<(Token, usize)> {
    let mut i = start + 1;
    let negated = matches!(chars.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    let mut ranges = Vec::new();
    let mut first = true;
    while let Some(&c) = chars.get(i) {
        // a leading `]` is a member, not the terminator
        if c == ']' && !first {
            return Some((Token::Class { negated, ranges }, i + 1));
        }
        first = false;
        if chars.get(i + 1) == Some(&'-') && chars.get(i + 2).is_some_and(|&e| e != ']') {
            ranges.push((c, chars[i + 2]));
            i += 3;
        } else {
            ranges.push((c, c));
            i += 1;
        }
    }
    None
}

/// Table-driven match: `next[j]` holds whether tokens[i+1..] match text[j..].
/// Runs in O(tokens * text) regardless of how many stars the pattern has.
fn match_tokens(tokens: &[Token], text: &[char]) -> bool {
    let m = text.len();
    let mut next = vec![false; m + 1];
    next[m] = true;
    let mut row = vec![false; m + 1];

    for token in tokens.iter().rev() {
        match token {
            Token::Star => {
                row[m] = next[m];
                for j in (0..m).rev() {
                    row[j] = next[j] || (text[j] != '/' && row[j + 1]);
                }
            }
            Token::GlobStar => {
                row[m] = next[m];
                for j in (0..m).rev() {
                    row[j] = next[j] || row[j + 1];
                }
            }
            Token::GlobStarSlash => {
                // ends_at_slash: some k >= j has text[k] == '/' and next[k + 1]
                let mut ends_at_slash = false;
                row[m] = next[m];
                for j in (0..m).rev() {
                    ends_at_slash |= text[j] == '/' && next[j + 1];
                    row[j] = next[j] || ends_at_slash;
                }
            }
            single => {
                row[m] = false;
                for j in 0..m {
                    row[j] = matches_one(single, text[j]) && next[j + 1];
                }
            }
        }
        std::mem::swap(&mut row, &mut next);
    }

    next[0]
}

fn matches_one(token: &Token, c: char) -> bool {
    match token {
        Token::Literal(l) => *l == c,
        Token::AnyChar => c != '/',
        Token::Class { negated, ranges } => {
            c != '/' && ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi) != *negated
        }
        Token::Star | Token::GlobStar | Token::GlobStarSlash => false,
    }
}

//! Glob-style name patterns for partial declarations.
//!
//! Supported syntax: `*` (any run of characters), `?` (one character),
//! `[abc]`, `[a-z]` and negated `[!abc]` / `[^abc]` classes.  Everything
//! else matches literally.
//!
//! Expansion always returns names in the order of the candidate list (the
//! component's variable declaration order), never in pattern order, so
//! assembly is deterministic.

use std::collections::HashMap;

/// True when `s` contains any glob metacharacter.
pub fn is_pattern(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Match a whole name against a glob pattern.
pub fn matches(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = name.chars().collect();
    match_from(&p, &s)
}

fn match_from(p: &[char], s: &[char]) -> bool {
    match p.first() {
        None => s.is_empty(),
        Some('*') => {
            let rest = &p[1..];
            if rest.is_empty() {
                return true;
            }
            (0..=s.len()).any(|i| match_from(rest, &s[i..]))
        }
        Some('?') => !s.is_empty() && match_from(&p[1..], &s[1..]),
        Some('[') => match parse_class(&p[1..]) {
            Some((class, consumed)) => match s.first() {
                Some(&c) => class.contains(c) && match_from(&p[1 + consumed..], &s[1..]),
                None => false,
            },
            // Unterminated class: '[' is literal.
            None => s.first() == Some(&'[') && match_from(&p[1..], &s[1..]),
        },
        Some(&c) => s.first() == Some(&c) && match_from(&p[1..], &s[1..]),
    }
}

struct CharClass {
    negated: bool,
    singles: Vec<char>,
    ranges: Vec<(char, char)>,
}

impl CharClass {
    fn contains(&self, c: char) -> bool {
        let hit = self.singles.contains(&c) || self.ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
        hit != self.negated
    }
}

/// Parse the body of a `[...]` class (`p` starts after the '[').
/// Returns the class and the number of chars consumed including the ']'.
fn parse_class(p: &[char]) -> Option<(CharClass, usize)> {
    let mut i = 0;
    let negated = matches!(p.first(), Some('!') | Some('^'));
    if negated {
        i += 1;
    }
    let mut class = CharClass { negated, singles: Vec::new(), ranges: Vec::new() };
    let body_start = i;
    while i < p.len() {
        let c = p[i];
        // A ']' right after the opening bracket is a literal member.
        if c == ']' && i > body_start {
            return Some((class, i + 1));
        }
        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            class.ranges.push((c, p[i + 2]));
            i += 3;
        } else {
            class.singles.push(c);
            i += 1;
        }
    }
    None
}

/// Expand one pattern (or literal name) against `names`.
///
/// Returns indices into `names`, ascending.  A literal that is not present
/// yields an empty list; callers decide whether that is an error.
pub fn expand<S: AsRef<str>>(pattern: &str, names: &[S]) -> Vec<usize> {
    if !is_pattern(pattern) {
        return names
            .iter()
            .position(|n| n.as_ref() == pattern)
            .into_iter()
            .collect();
    }
    names
        .iter()
        .enumerate()
        .filter(|(_, n)| matches(pattern, n.as_ref()))
        .map(|(i, _)| i)
        .collect()
}

// ─────────────────────────────────────────────────────────────
//  Per-component expansion cache
// ─────────────────────────────────────────────────────────────

/// Memoized expansions against one fixed candidate list.
///
/// Built at setup time for a single component; the candidate list never
/// changes while the cache is alive.
#[derive(Debug, Clone)]
pub struct ExpansionCache {
    names: Vec<String>,
    cache: HashMap<String, Vec<usize>>,
}

impl ExpansionCache {
    pub fn new(names: Vec<String>) -> Self {
        Self { names, cache: HashMap::new() }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Expand one pattern, reusing an earlier result when available.
    pub fn expand(&mut self, pattern: &str) -> &[usize] {
        let names = &self.names;
        self.cache
            .entry(pattern.to_string())
            .or_insert_with(|| expand(pattern, names.as_slice()))
    }

    /// Union of several patterns, in candidate order, without duplicates.
    pub fn expand_all(&mut self, patterns: &[String]) -> Vec<usize> {
        let mut hit = vec![false; self.names.len()];
        for pat in patterns {
            for &i in self.expand(pat) {
                hit[i] = true;
            }
        }
        hit.iter().enumerate().filter(|(_, &h)| h).map(|(i, _)| i).collect()
    }
}

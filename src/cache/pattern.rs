//! Invalidation patterns.
//!
//! A pattern is a literal substring in which `*` stands for any run of
//! characters. A key matches when the pattern occurs anywhere in it, which is
//! the local equivalent of the distributed `KEYS *pattern*` scan.

use super::CacheError;

/// Validated invalidation pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    raw: String,
    // Literal pieces between `*`s, empty pieces dropped.
    pieces: Vec<String>,
}

impl KeyPattern {
    pub fn parse(raw: &str) -> Result<Self, CacheError> {
        let pieces: Vec<String> = raw
            .split('*')
            .filter(|piece| !piece.is_empty())
            .map(str::to_string)
            .collect();

        if pieces.is_empty() {
            return Err(CacheError::InvalidPattern {
                pattern: raw.to_string(),
                reason: "pattern must contain at least one literal character",
            });
        }

        Ok(Self {
            raw: raw.to_string(),
            pieces,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when every literal piece occurs in `key`, in order, without overlap.
    pub fn matches(&self, key: &str) -> bool {
        let mut rest = key;
        for piece in &self.pieces {
            match rest.find(piece.as_str()) {
                Some(idx) => rest = &rest[idx + piece.len()..],
                None => return false,
            }
        }
        true
    }

    /// Distributed-tier glob for keys under `prefix` containing this pattern.
    pub fn to_glob(&self, prefix: &str) -> String {
        let mut glob = escape_glob(prefix);
        glob.push('*');
        for piece in &self.pieces {
            glob.push_str(&escape_glob(piece));
            glob.push('*');
        }
        glob
    }
}

/// Escape the glob metacharacters understood by `KEYS`, `*` included.
pub fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_pattern_matches_anywhere() {
        let pattern = KeyPattern::parse("produtos").expect("valid pattern");
        assert!(pattern.matches("produtos:/api/produtos?page=2"));
        assert!(pattern.matches("/api/vitrine/produtos"));
        assert!(!pattern.matches("estoque:/api/estoque"));
    }

    #[test]
    fn wildcard_requires_pieces_in_order() {
        let pattern = KeyPattern::parse("vendas*2024").expect("valid pattern");
        assert!(pattern.matches("vendas:/api/vendas?ano=2024"));
        assert!(!pattern.matches("2024:/api/vendas"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pattern = KeyPattern::parse("/api/produtos?id=(1)").expect("valid pattern");
        assert!(pattern.matches("produtos:/api/produtos?id=(1)"));
        assert!(!pattern.matches("produtos:/api/produtosXid=(1)"));
    }

    #[test]
    fn empty_and_bare_wildcards_are_rejected() {
        assert!(KeyPattern::parse("").is_err());
        assert!(KeyPattern::parse("**").is_err());
    }

    #[test]
    fn glob_escapes_metacharacters_and_wraps_with_wildcards() {
        let pattern = KeyPattern::parse("a?b*[c]").expect("valid pattern");
        assert_eq!(pattern.to_glob("balcao:"), "balcao:*a\\?b*\\[c\\]*");
    }
}

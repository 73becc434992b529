//! Hostlist parsing and formatting, per spec §6 "Hostlist parser (used by
//! bootstrap)": parse a compact hostlist expression, enumerate hostnames by
//! rank, return the host count, and format the list back to a canonical
//! string.
//!
//! Grounded on `examples/original_source/src/common/libhostlist/hostname.c`
//! and `hostrange.c`; this is a deliberately smaller subset than the
//! original `libhostlist` (no sorting, set algebra, or deletion — those
//! aren't part of the bootstrap contract this crate serves, see
//! `DESIGN.md`).
//!
//! A hostlist expression is a comma-separated sequence of tokens, each
//! either a plain hostname (`node5`) or a bracketed numeric range
//! (`node[1-3,5]`, `node[01-10]ib0`). Commas inside `[...]` separate range
//! parts, not tokens.

use weft_base::{invalid, Result};

/// One `lo-hi` (or single `lo==hi`) part of a bracketed range, with an
/// optional zero-pad width carried over from the literal text (`"01"` pads
/// to width 2; `"1"` does not pad at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RangePart {
    lo: u64,
    hi: u64,
    width: Option<usize>,
}

impl RangePart {
    fn len(&self) -> u64 {
        self.hi - self.lo + 1
    }

    fn format_num(&self, n: u64) -> String {
        match self.width {
            Some(w) => format!("{n:0w$}", w = w),
            None => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Literal(String),
    Bracket { prefix: String, parts: Vec<RangePart>, trailing: String },
}

impl Entry {
    fn count(&self) -> u64 {
        match self {
            Entry::Literal(_) => 1,
            Entry::Bracket { parts, .. } => parts.iter().map(RangePart::len).sum(),
        }
    }

    fn push_expanded(&self, out: &mut Vec<String>) {
        match self {
            Entry::Literal(s) => out.push(s.clone()),
            Entry::Bracket { prefix, parts, trailing } => {
                for part in parts {
                    for n in part.lo..=part.hi {
                        out.push(format!("{prefix}{}{trailing}", part.format_num(n)));
                    }
                }
            }
        }
    }

    fn canonical(&self) -> String {
        match self {
            Entry::Literal(s) => s.clone(),
            Entry::Bracket { prefix, parts, trailing } => {
                if parts.len() == 1 && parts[0].lo == parts[0].hi {
                    return format!("{prefix}{}{trailing}", parts[0].format_num(parts[0].lo));
                }
                let body = parts
                    .iter()
                    .map(|p| {
                        if p.lo == p.hi {
                            p.format_num(p.lo)
                        } else {
                            format!("{}-{}", p.format_num(p.lo), p.format_num(p.hi))
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{prefix}[{body}]{trailing}")
            }
        }
    }
}

/// A parsed, ordered hostlist. Order is preserved as written; this crate
/// does no sorting or deduplication of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostList {
    entries: Vec<Entry>,
}

impl HostList {
    /// Parses a hostlist expression such as `"node[1-3,5],spare"`.
    pub fn parse(expr: &str) -> Result<HostList> {
        let mut entries = Vec::new();
        for token in split_top_level(expr) {
            if token.is_empty() {
                return Err(invalid("empty hostlist token"));
            }
            entries.push(parse_token(token)?);
        }
        Ok(HostList { entries })
    }

    /// Total number of hostnames represented, counting every expanded range.
    pub fn count(&self) -> u64 {
        self.entries.iter().map(Entry::count).sum()
    }

    /// All hostnames in rank order.
    pub fn expand(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.count() as usize);
        for entry in &self.entries {
            entry.push_expanded(&mut out);
        }
        out
    }

    /// The hostname at the given rank, or `None` if out of range.
    pub fn nth(&self, rank: u64) -> Option<String> {
        self.expand().into_iter().nth(rank as usize)
    }

    /// The rank of `name` in this list, or `None` if absent.
    pub fn find_rank(&self, name: &str) -> Option<u64> {
        self.expand().iter().position(|h| h == name).map(|i| i as u64)
    }

    /// Formats the list back to its canonical compact string form.
    pub fn to_compact_string(&self) -> String {
        self.entries.iter().map(Entry::canonical).collect::<Vec<_>>().join(",")
    }
}

impl std::fmt::Display for HostList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_compact_string())
    }
}

fn split_top_level(expr: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in expr.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ',' if depth == 0 => {
                out.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&expr[start..]);
    out
}

fn parse_token(token: &str) -> Result<Entry> {
    let Some(open) = token.find('[') else {
        return Ok(Entry::Literal(token.to_string()));
    };
    let prefix = &token[..open];
    let Some(rel_close) = token[open..].find(']') else {
        return Err(invalid(format!("unterminated range in hostlist token {token:?}")));
    };
    let close = open + rel_close;
    let body = &token[open + 1..close];
    let trailing = &token[close + 1..];

    if body.is_empty() {
        return Err(invalid(format!("empty range in hostlist token {token:?}")));
    }

    let mut parts = Vec::new();
    for piece in body.split(',') {
        parts.push(parse_range_part(piece)?);
    }

    Ok(Entry::Bracket { prefix: prefix.to_string(), parts, trailing: trailing.to_string() })
}

fn parse_range_part(piece: &str) -> Result<RangePart> {
    match piece.split_once('-') {
        Some((lo_str, hi_str)) => {
            let lo = parse_num(lo_str)?;
            let hi = parse_num(hi_str)?;
            if hi < lo {
                return Err(invalid(format!("descending range {piece:?}")));
            }
            let width = pad_width(lo_str).or_else(|| pad_width(hi_str));
            Ok(RangePart { lo, hi, width })
        }
        None => {
            let n = parse_num(piece)?;
            Ok(RangePart { lo: n, hi: n, width: pad_width(piece) })
        }
    }
}

fn parse_num(s: &str) -> Result<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(format!("not a numeric hostlist bound: {s:?}")));
    }
    s.parse::<u64>().map_err(|_| invalid(format!("hostlist bound out of range: {s:?}")))
}

fn pad_width(s: &str) -> Option<usize> {
    if s.len() > 1 && s.starts_with('0') {
        Some(s.len())
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_hostname_round_trips() {
        let hl = HostList::parse("node5").unwrap();
        assert_eq!(hl.count(), 1);
        assert_eq!(hl.expand(), vec!["node5".to_string()]);
        assert_eq!(hl.to_compact_string(), "node5");
    }

    #[test]
    fn bracketed_range_expands_in_order() {
        let hl = HostList::parse("node[1-3,5]").unwrap();
        assert_eq!(hl.count(), 4);
        assert_eq!(
            hl.expand(),
            vec!["node1".to_string(), "node2".to_string(), "node3".to_string(), "node5".to_string()]
        );
        assert_eq!(hl.to_compact_string(), "node[1-3,5]");
    }

    #[test]
    fn zero_padded_range_preserves_width_and_trailing_suffix() {
        let hl = HostList::parse("node[01-10]ib0").unwrap();
        assert_eq!(hl.count(), 10);
        assert_eq!(hl.nth(0).unwrap(), "node01ib0");
        assert_eq!(hl.nth(9).unwrap(), "node10ib0");
        assert_eq!(hl.to_compact_string(), "node[01-10]ib0");
    }

    #[test]
    fn top_level_comma_separates_outside_brackets_only() {
        let hl = HostList::parse("node[1-2],spare,node[9]").unwrap();
        assert_eq!(hl.count(), 3);
        assert_eq!(
            hl.expand(),
            vec!["node1".to_string(), "node2".to_string(), "spare".to_string(), "node9".to_string()]
        );
        // a singleton bracketed range canonicalizes without brackets.
        assert_eq!(hl.to_compact_string(), "node[1-2],spare,node9");
    }

    #[test]
    fn find_rank_locates_expanded_hostname() {
        let hl = HostList::parse("node[1-3,5]").unwrap();
        assert_eq!(hl.find_rank("node3"), Some(2));
        assert_eq!(hl.find_rank("node5"), Some(3));
        assert_eq!(hl.find_rank("node4"), None);
    }

    #[test]
    fn descending_range_is_rejected() {
        assert!(HostList::parse("node[5-1]").is_err());
    }

    #[test]
    fn unterminated_bracket_is_rejected() {
        assert!(HostList::parse("node[1-3").is_err());
    }

    #[test]
    fn non_numeric_bound_is_rejected() {
        assert!(HostList::parse("node[a-b]").is_err());
    }
}

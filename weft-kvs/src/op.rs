//! Commit ops and key normalization (spec §4.6 "Commit Engine").

use bitflags::bitflags;

use weft_base::Result;
use weft_kvs_store::TreeObject;

bitflags! {
    /// Per-op modifiers. `APPEND` turns a write into "add to the value's
    /// VALREF chain instead of replacing it"; `NO_MERGE` marks the whole
    /// commit it belongs to as ineligible for merging with a sibling commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u8 {
        const APPEND = 0b01;
        const NO_MERGE = 0b10;
    }
}

/// A single write or delete against a key path. `value: None` is a delete;
/// `Some` is a write (plain, or an append when `APPEND` is set).
#[derive(Debug, Clone)]
pub struct Op {
    pub key: String,
    pub flags: OpFlags,
    pub value: Option<TreeObject>,
}

impl Op {
    pub fn write(key: impl Into<String>, value: TreeObject) -> Op {
        Op { key: key.into(), flags: OpFlags::empty(), value: Some(value) }
    }

    pub fn append(key: impl Into<String>, value: TreeObject) -> Op {
        Op { key: key.into(), flags: OpFlags::APPEND, value: Some(value) }
    }

    pub fn delete(key: impl Into<String>) -> Op {
        Op { key: key.into(), flags: OpFlags::empty(), value: None }
    }

    pub fn no_merge(mut self) -> Op {
        self.flags |= OpFlags::NO_MERGE;
        self
    }
}

/// Splits a `.`-separated key into its normalized components: runs of
/// empty segments collapse, so `"a..b."`, `"a.b"`, and `".a.b"` all
/// normalize to `["a", "b"]`. The empty component list denotes the tree
/// root (the normalized form of `"."`).
pub fn normalize_key(key: &str) -> Vec<String> {
    key.split('.').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// Splits a symlink target the same way, for prefixing onto the remainder
/// of a path being walked (spec §9 "Symlinks").
pub fn split_target(target: &str) -> Vec<String> {
    normalize_key(target)
}

pub(crate) fn require_non_root(components: &[String]) -> Result<()> {
    if components.is_empty() {
        return Err(weft_base::invalid("cannot write or delete the tree root directly"));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn collapses_repeated_and_leading_separators() {
        assert_eq!(normalize_key("a..b."), vec!["a", "b"]);
        assert_eq!(normalize_key(".a.b"), vec!["a", "b"]);
        assert_eq!(normalize_key("."), Vec::<String>::new());
        assert_eq!(normalize_key(""), Vec::<String>::new());
    }
}

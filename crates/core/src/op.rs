//! Operation kinds and the requested filter set

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Resolved operation of a coalesced event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// File or directory created
    Create,
    /// File content changed
    Write,
    /// Renamed within the same parent directory
    Rename,
    /// Moved to a different parent directory
    Move,
    /// File or directory removed
    Remove,
}

impl Op {
    /// All operations in declaration order
    pub const ALL: [Op; 5] = [Op::Create, Op::Write, Op::Rename, Op::Move, Op::Remove];

    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Write => "write",
            Op::Rename => "rename",
            Op::Move => "move",
            Op::Remove => "remove",
        }
    }

    /// Whether events of this kind carry a prior path
    pub fn has_old_path(&self) -> bool {
        matches!(self, Op::Rename | Op::Move)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Op {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Op::Create),
            "write" => Ok(Op::Write),
            "rename" => Ok(Op::Rename),
            "move" => Ok(Op::Move),
            "remove" => Ok(Op::Remove),
            other => Err(format!(
                "unknown operation '{}' (expected create, write, rename, move or remove)",
                other
            )),
        }
    }
}

/// Ordered set of requested operations
///
/// An empty set means "all operations".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Op>", into = "Vec<Op>")]
pub struct FilterSet {
    ops: Vec<Op>,
}

impl FilterSet {
    /// Filter set that lets every operation through
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let mut set = Self::default();
        for op in ops {
            if !set.ops.contains(&op) {
                set.ops.push(op);
            }
        }
        set
    }

    /// Whether an event with `op` is delivered
    pub fn allows(&self, op: Op) -> bool {
        self.ops.is_empty() || self.ops.contains(&op)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }
}

impl From<Vec<Op>> for FilterSet {
    fn from(ops: Vec<Op>) -> Self {
        Self::new(ops)
    }
}

impl From<FilterSet> for Vec<Op> {
    fn from(set: FilterSet) -> Self {
        set.ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_parse() {
        assert_eq!("create".parse::<Op>().unwrap(), Op::Create);
        assert_eq!("WRITE".parse::<Op>().unwrap(), Op::Write);
        assert!("chmod".parse::<Op>().is_err());
    }

    #[test]
    fn test_op_wire_names() {
        assert_eq!(serde_json::to_string(&Op::Move).unwrap(), "\"move\"");
        let op: Op = serde_json::from_str("\"rename\"").unwrap();
        assert_eq!(op, Op::Rename);
    }

    #[test]
    fn test_empty_filter_allows_everything() {
        let filters = FilterSet::all();
        for op in Op::ALL {
            assert!(filters.allows(op));
        }
    }

    #[test]
    fn test_filter_restricts() {
        let filters = FilterSet::new([Op::Create, Op::Write]);

        assert!(filters.allows(Op::Create));
        assert!(filters.allows(Op::Write));
        assert!(!filters.allows(Op::Rename));
        assert!(!filters.allows(Op::Move));
        assert!(!filters.allows(Op::Remove));
    }

    #[test]
    fn test_filter_dedup_keeps_order() {
        let filters = FilterSet::new([Op::Write, Op::Create, Op::Write]);
        assert_eq!(filters.ops(), &[Op::Write, Op::Create]);

        let json = serde_json::to_string(&filters).unwrap();
        assert_eq!(json, "[\"write\",\"create\"]");
    }
}

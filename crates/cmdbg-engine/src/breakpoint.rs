//! Breakpoint and watchpoint records.

use std::fmt;
use std::ops::BitOr;

use smol_str::SmolStr;

use crate::script::ScriptLocation;
use crate::watch::VariableAccess;

/// Line sentinel matching any line of a file.
pub const LINE_ANY: u64 = u64::MAX;

/// A source breakpoint.
///
/// Matching is suffix-path containment: a statement matches when its full
/// path contains `file` as a substring and the lines agree (or `line` is
/// [`LINE_ANY`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Identifier, unique across breakpoints and watchpoints.
    pub id: u64,
    /// File fragment the breakpoint was set on.
    pub file: String,
    /// 1-based line, or [`LINE_ANY`].
    pub line: u64,
}

impl Breakpoint {
    pub(crate) fn new(id: u64, file: impl Into<String>, line: u64) -> Self {
        Self {
            id,
            file: file.into(),
            line,
        }
    }

    /// Whether the breakpoint fires for the given path and line.
    #[must_use]
    pub fn matches(&self, path: &str, line: u64) -> bool {
        if self.file.is_empty() {
            return false;
        }
        if self.line != line && self.line != LINE_ANY {
            return false;
        }
        path.contains(&self.file)
    }

    /// Whether the breakpoint fires for a statement location.
    #[must_use]
    pub fn matches_location(&self, location: &ScriptLocation) -> bool {
        self.matches(&location.path, location.line)
    }
}

/// Bit set of variable-access kinds a watchpoint triggers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchMask(u8);

impl WatchMask {
    pub const NONE: WatchMask = WatchMask(0);
    pub const DEFINE: WatchMask = WatchMask(1);
    pub const WRITE: WatchMask = WatchMask(2);
    pub const READ: WatchMask = WatchMask(4);
    pub const UNDEFINED: WatchMask = WatchMask(8);
    /// Anything that changes the variable.
    pub const MODIFY: WatchMask = WatchMask(1 | 2 | 8);
    pub const ALL: WatchMask = WatchMask(1 | 2 | 4 | 8);

    /// Whether any bit of `other` is set in `self`.
    #[must_use]
    pub fn intersects(self, other: WatchMask) -> bool {
        self.0 & other.0 != 0
    }

    /// The mask bit a reported access kind corresponds to.
    #[must_use]
    pub fn for_access(access: VariableAccess) -> WatchMask {
        match access {
            VariableAccess::Read | VariableAccess::UnknownRead => WatchMask::READ,
            VariableAccess::Modified => WatchMask::WRITE,
            VariableAccess::UnknownDefined => WatchMask::DEFINE,
            VariableAccess::Removed => WatchMask::UNDEFINED,
        }
    }
}

impl BitOr for WatchMask {
    type Output = WatchMask;

    fn bitor(self, rhs: WatchMask) -> WatchMask {
        WatchMask(self.0 | rhs.0)
    }
}

impl fmt::Display for WatchMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exact = match *self {
            WatchMask::NONE => Some("NONE"),
            WatchMask::ALL => Some("ALL"),
            WatchMask::MODIFY => Some("MODIFY"),
            WatchMask::DEFINE => Some("DEFINE"),
            WatchMask::WRITE => Some("WRITE"),
            WatchMask::READ => Some("READ"),
            WatchMask::UNDEFINED => Some("UNDEFINED"),
            _ => None,
        };
        if let Some(name) = exact {
            return f.write_str(name);
        }
        let mut first = true;
        for (bit, name) in [
            (WatchMask::DEFINE, "DEFINE"),
            (WatchMask::WRITE, "WRITE"),
            (WatchMask::READ, "READ"),
            (WatchMask::UNDEFINED, "UNDEFINED"),
        ] {
            if self.intersects(bit) {
                if !first {
                    f.write_str(", ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Snapshot of a live watchpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchpoint {
    /// Identifier, unique across breakpoints and watchpoints.
    pub id: u64,
    /// Watched variable name.
    pub variable: SmolStr,
    /// Access kinds the watchpoint triggers on.
    pub mask: WatchMask,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_is_suffix_path_containment() {
        let bp = Breakpoint::new(1, "foo.txt", 10);
        assert!(bp.matches("/a/b/foo.txt", 10));
        assert!(!bp.matches("/a/b/bar.txt", 10));
        assert!(!bp.matches("/a/b/foo.txt", 11));
    }

    #[test]
    fn line_sentinel_matches_any_line() {
        let bp = Breakpoint::new(1, "foo.txt", LINE_ANY);
        assert!(bp.matches("/a/b/foo.txt", 1));
        assert!(bp.matches("/a/b/foo.txt", 999));
        assert!(!bp.matches("/a/b/bar.txt", 1));
    }

    #[test]
    fn empty_file_never_matches() {
        let bp = Breakpoint::new(1, "", LINE_ANY);
        assert!(!bp.matches("/a/b/foo.txt", 1));
    }

    #[test]
    fn mask_renders_exact_names_and_combinations() {
        assert_eq!(WatchMask::READ.to_string(), "READ");
        assert_eq!(WatchMask::MODIFY.to_string(), "MODIFY");
        assert_eq!(WatchMask::ALL.to_string(), "ALL");
        assert_eq!(
            (WatchMask::WRITE | WatchMask::READ).to_string(),
            "WRITE, READ"
        );
    }

    #[test]
    fn mask_intersection_follows_access_bits() {
        assert!(WatchMask::MODIFY.intersects(WatchMask::WRITE));
        assert!(WatchMask::MODIFY.intersects(WatchMask::UNDEFINED));
        assert!(!WatchMask::MODIFY.intersects(WatchMask::READ));
        assert!(WatchMask::ALL.intersects(WatchMask::READ));
    }
}

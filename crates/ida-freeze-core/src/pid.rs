//! Persistent identifier generation.

use uuid::Uuid;

const MAX_SUFFIX_LEN: usize = 10;

/// What a pid identifies; determines the one letter suffix prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidKind {
    Action,
    File,
    Folder,
}

impl PidKind {
    fn prefix(&self) -> char {
        match self {
            PidKind::Action => 'a',
            PidKind::File => 'f',
            PidKind::Folder => 'd',
        }
    }
}

/// Generate a new pid: a time ordered unique part followed by a short
/// suffix naming the kind and node.
pub fn generate(kind: PidKind, node: i64) -> String {
    let mut suffix = format!("{}{}", kind.prefix(), node.unsigned_abs());
    suffix.truncate(MAX_SUFFIX_LEN);
    format!("{}{}", Uuid::now_v7().simple(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pids_are_unique_and_suffixed() {
        let a = generate(PidKind::Action, 42);
        let b = generate(PidKind::Action, 42);
        assert_ne!(a, b);
        assert!(a.ends_with("a42"));
        assert!(generate(PidKind::File, 7).ends_with("f7"));
    }

    #[test]
    fn test_suffix_is_capped() {
        let pid = generate(PidKind::Folder, 123_456_789_012);
        assert!(pid.ends_with("d123456789"));
        assert_eq!(pid.len(), 32 + MAX_SUFFIX_LEN);
    }
}

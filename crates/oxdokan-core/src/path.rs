//! Volume-relative paths as the driver delivers them.
//!
//! The driver hands every callback a UTF-16 path relative to the volume root,
//! such as `\dir\file.txt`. [`DokanPath`] is the normalised form: a leading
//! backslash, backslash separators, no empty or `.` components and no trailing
//! separator (except for the root itself).
//!
//! Windows names are case-insensitive unless the volume was mounted with
//! `CASE_SENSITIVE`, so identity comparisons go through [`PathKey`].

use std::fmt;

use crate::error::{DokanError, DokanResult};
use crate::status::NtStatus;

/// Longest path the Win32 layer accepts, including the terminator.
pub const MAX_PATH: usize = 260;

/// Path separator used on the volume.
pub const SEPARATOR: char = '\\';

const INVALID_NAME_CHARS: &[char] = &['<', '>', '"', '|', '?', '*', '/'];

/// A normalised volume-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DokanPath(String);

/// Case-folded identity of a path.
///
/// Two opens refer to the same file exactly when their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey(String);

impl DokanPath {
    /// The volume root, `\`.
    pub fn root() -> Self {
        DokanPath(SEPARATOR.to_string())
    }

    /// Normalises and validates a raw path, rejecting stream names.
    pub fn parse(raw: &str) -> DokanResult<Self> {
        Self::parse_inner(raw, false)
    }

    /// Like [`parse`](Self::parse) but accepts `name:stream[:type]` in the
    /// final component, for volumes mounted with alternate streams.
    pub fn parse_with_streams(raw: &str) -> DokanResult<Self> {
        Self::parse_inner(raw, true)
    }

    fn parse_inner(raw: &str, allow_streams: bool) -> DokanResult<Self> {
        let mut normalized = String::with_capacity(raw.len() + 1);
        let components: Vec<&str> = raw
            .split(['\\', '/'])
            .filter(|c| !c.is_empty() && *c != ".")
            .collect();

        for (index, component) in components.iter().enumerate() {
            let last = index + 1 == components.len();
            validate_component(component, allow_streams && last)?;
            normalized.push(SEPARATOR);
            normalized.push_str(component);
        }

        if normalized.is_empty() {
            return Ok(Self::root());
        }
        Ok(DokanPath(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// Path components below the root.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|c| !c.is_empty())
    }

    /// Final component, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit(SEPARATOR).next()
    }

    /// Containing directory, or `None` for the root.
    pub fn parent(&self) -> Option<DokanPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(SEPARATOR) {
            Some(0) | None => Some(Self::root()),
            Some(idx) => Some(DokanPath(self.0[..idx].to_string())),
        }
    }

    /// Appends a single validated name.
    pub fn join(&self, name: &str) -> DokanResult<DokanPath> {
        if name.contains(['\\', '/']) || name.is_empty() || name == "." {
            return Err(DokanError::Status(NtStatus::OBJECT_NAME_INVALID));
        }
        validate_component(name, false)?;
        let mut joined = self.0.clone();
        if !self.is_root() {
            joined.push(SEPARATOR);
        }
        joined.push_str(name);
        Ok(DokanPath(joined))
    }

    /// Identity key; case-folded unless `case_sensitive`.
    pub fn key(&self, case_sensitive: bool) -> PathKey {
        if case_sensitive {
            PathKey(self.0.clone())
        } else {
            PathKey(self.0.to_uppercase())
        }
    }

    /// True when `self` equals `ancestor` or lies beneath it.
    pub fn is_within(&self, ancestor: &DokanPath, case_sensitive: bool) -> bool {
        let me = self.key(case_sensitive);
        let other = ancestor.key(case_sensitive);
        if ancestor.is_root() || me == other {
            return true;
        }
        me.0.strip_prefix(&other.0)
            .is_some_and(|rest| rest.starts_with(SEPARATOR))
    }

    /// Rewrites the `from` prefix of this path to `to`.
    ///
    /// Returns `None` when `self` is not within `from`.
    pub fn rebase(&self, from: &DokanPath, to: &DokanPath, case_sensitive: bool) -> Option<DokanPath> {
        if !self.is_within(from, case_sensitive) {
            return None;
        }
        let rest = if from.is_root() {
            &self.0[..]
        } else {
            self.0.get(from.0.len()..)?
        };
        if rest.is_empty() {
            return Some(to.clone());
        }
        if to.is_root() {
            return Some(DokanPath(rest.to_string()));
        }
        Some(DokanPath(format!("{}{rest}", to.0)))
    }
}

impl fmt::Display for DokanPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DokanPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_component(component: &str, allow_stream: bool) -> DokanResult<()> {
    if component == ".." {
        return Err(DokanError::Status(NtStatus::OBJECT_NAME_INVALID));
    }
    if component.encode_utf16().count() >= MAX_PATH {
        return Err(DokanError::Status(NtStatus::NAME_TOO_LONG));
    }
    if component
        .chars()
        .any(|c| c < ' ' || INVALID_NAME_CHARS.contains(&c))
    {
        return Err(DokanError::Status(NtStatus::OBJECT_NAME_INVALID));
    }
    if component.contains(':') {
        // name:stream or name:stream:$DATA
        let parts = component.split(':').count();
        if !allow_stream || parts > 3 || component.starts_with(':') {
            return Err(DokanError::Status(NtStatus::OBJECT_NAME_INVALID));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn p(raw: &str) -> DokanPath {
        DokanPath::parse(raw).unwrap()
    }

    #[test]
    fn test_normalization() {
        assert_eq!(p("").as_str(), "\\");
        assert_eq!(p("\\").as_str(), "\\");
        assert_eq!(p("/a.txt").as_str(), "\\a.txt");
        assert_eq!(p("\\dir\\\\sub\\").as_str(), "\\dir\\sub");
        assert_eq!(p("dir/./file").as_str(), "\\dir\\file");
    }

    #[test]
    fn test_parent_and_file_name() {
        let path = p("\\dir\\sub\\file.txt");
        assert_eq!(path.file_name(), Some("file.txt"));
        assert_eq!(path.parent(), Some(p("\\dir\\sub")));
        assert_eq!(p("\\top").parent(), Some(DokanPath::root()));
        assert_eq!(DokanPath::root().parent(), None);
        assert_eq!(DokanPath::root().file_name(), None);
    }

    #[test]
    fn test_invalid_names() {
        let status = |raw: &str| DokanPath::parse(raw).unwrap_err().to_ntstatus();
        assert_eq!(status("\\a\\..\\b"), NtStatus::OBJECT_NAME_INVALID);
        assert_eq!(status("\\bad|name"), NtStatus::OBJECT_NAME_INVALID);
        assert_eq!(status("\\wild*"), NtStatus::OBJECT_NAME_INVALID);
        assert_eq!(status("\\file.txt:stream"), NtStatus::OBJECT_NAME_INVALID);
        let long = format!("\\{}", "x".repeat(MAX_PATH));
        assert_eq!(status(&long), NtStatus::NAME_TOO_LONG);
    }

    #[test]
    fn test_streams_only_in_last_component() {
        assert!(DokanPath::parse_with_streams("\\file.txt:meta:$DATA").is_ok());
        assert!(DokanPath::parse_with_streams("\\dir:x\\file.txt").is_err());
    }

    #[test]
    fn test_case_folded_key() {
        assert_eq!(p("\\Dir\\A.TXT").key(false), p("\\dir\\a.txt").key(false));
        assert_ne!(p("\\Dir\\A.TXT").key(true), p("\\dir\\a.txt").key(true));
    }

    #[test]
    fn test_join() {
        assert_eq!(DokanPath::root().join("a").unwrap(), p("\\a"));
        assert_eq!(p("\\a").join("b").unwrap(), p("\\a\\b"));
        assert!(p("\\a").join("b\\c").is_err());
    }

    #[test]
    fn test_within_and_rebase() {
        let dir = p("\\docs");
        assert!(p("\\DOCS\\a.txt").is_within(&dir, false));
        assert!(!p("\\docs2\\a.txt").is_within(&dir, false));
        assert!(p("\\docs").is_within(&dir, true));
        assert_eq!(
            p("\\docs\\sub\\a.txt").rebase(&dir, &p("\\archive"), false),
            Some(p("\\archive\\sub\\a.txt"))
        );
        assert_eq!(p("\\docs").rebase(&dir, &p("\\x"), false), Some(p("\\x")));
        assert_eq!(p("\\other").rebase(&dir, &p("\\x"), false), None);
    }

    proptest! {
        #[test]
        fn prop_parse_is_idempotent(parts in prop::collection::vec("[a-zA-Z0-9 ._-]{1,12}", 0..6)) {
            let raw = parts.join("\\");
            if let Ok(first) = DokanPath::parse(&raw) {
                let second = DokanPath::parse(first.as_str()).unwrap();
                prop_assert_eq!(&first, &second);
                prop_assert!(first.as_str().starts_with('\\'));
                prop_assert!(!first.as_str().contains("\\\\"));
                prop_assert!(first.is_root() || !first.as_str().ends_with('\\'));
            }
        }

        #[test]
        fn prop_parent_join_round_trip(parts in prop::collection::vec("[a-zA-Z0-9_-]{1,12}", 1..6)) {
            let path = DokanPath::parse(&parts.join("/")).unwrap();
            let parent = path.parent().unwrap();
            let name = path.file_name().unwrap();
            prop_assert_eq!(parent.join(name).unwrap(), path);
        }
    }
}

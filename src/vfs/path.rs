//! Validated path newtype, mirroring the teacher's convention of wrapping
//! filesystem-adjacent strings rather than passing raw `String` around
//! (SPEC_FULL.md §3.x).

use std::fmt;

use crate::error::VfsError;

/// An absolute, POSIX-style path rooted at `/`. Never contains `..`
/// segments and never ends in `/` except for the root itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VfsPath(String);

impl VfsPath {
    pub fn new(raw: impl Into<String>) -> Result<Self, VfsError> {
        let raw = raw.into();
        if !raw.starts_with('/') {
            return Err(VfsError::InvalidPath(raw));
        }
        if raw.split('/').any(|seg| seg == "..") {
            return Err(VfsError::InvalidPath(raw));
        }
        if raw.len() > 1 && raw.ends_with('/') {
            return Err(VfsError::InvalidPath(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_prefixed_by(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// The file's basename without extension, e.g. `/tools/AddNumbers.js` -> `AddNumbers`.
    pub fn stem(&self) -> &str {
        let base = self.0.rsplit('/').next().unwrap_or(&self.0);
        match base.rfind('.') {
            Some(idx) => &base[..idx],
            None => base,
        }
    }

    pub fn is_substrate(&self) -> bool {
        self.0.starts_with("/core/") || self.0.starts_with("/infrastructure/")
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for VfsPath {
    type Error = VfsError;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        VfsPath::new(value)
    }
}

impl TryFrom<String> for VfsPath {
    type Error = VfsError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        VfsPath::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_and_dotdot() {
        assert!(VfsPath::new("tools/Foo.js").is_err());
        assert!(VfsPath::new("/tools/../core/Bad.js").is_err());
    }

    #[test]
    fn rejects_trailing_slash_except_root() {
        assert!(VfsPath::new("/tools/").is_err());
        assert!(VfsPath::new("/").is_ok());
    }

    #[test]
    fn stem_strips_extension() {
        let p = VfsPath::new("/tools/AddNumbers.js").unwrap();
        assert_eq!(p.stem(), "AddNumbers");
    }

    #[test]
    fn substrate_detection() {
        assert!(VfsPath::new("/core/agent.js").unwrap().is_substrate());
        assert!(VfsPath::new("/infrastructure/x.js").unwrap().is_substrate());
        assert!(!VfsPath::new("/tools/X.js").unwrap().is_substrate());
    }
}

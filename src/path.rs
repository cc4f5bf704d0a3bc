//! D-Bus object paths.
//!
//! An object path is a `/`-delimited hierarchical name identifying an object exported on the bus,
//! like `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`. The [`Path`] type validates the string once on
//! construction and offers the ancestor/descendant queries used to walk the object tree one
//! element at a time.

use core::fmt;
use std::str::FromStr;

/// A validated D-Bus object path.
///
/// A valid path starts with `/`, has no empty elements, and only the root path `/` may end with a
/// `/`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(String);

impl Path {
    /// Returns the root path `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Validates `path` and wraps it.
    pub fn new(path: impl Into<String>) -> Result<Self, ParsePathError> {
        let path = path.into();
        validate(&path)?;
        Ok(Self(path))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Returns the non-empty elements of the path, in order.
    ///
    /// The root path has no elements.
    pub fn split_elements(&self) -> Vec<&str> {
        self.elements().collect()
    }

    /// Returns the number of elements in the path.
    pub fn count_elements(&self) -> usize {
        self.elements().count()
    }

    /// Returns the path made of the first `count` elements of this one.
    ///
    /// Asking for more elements than the path has returns the whole path.
    pub fn fetch_elements(&self, count: usize) -> Path {
        let mut out = String::new();
        for element in self.elements().take(count) {
            out.push('/');
            out.push_str(element);
        }
        if out.is_empty() {
            return Path::root();
        }
        Path(out)
    }

    /// Returns the last element of the path, or `None` for the root path.
    pub fn last_element(&self) -> Option<&str> {
        self.elements().last()
    }

    /// Returns the parent of this path, or `None` for the root path.
    pub fn parent(&self) -> Option<Path> {
        match self.count_elements() {
            0 => None,
            n => Some(self.fetch_elements(n - 1)),
        }
    }

    /// Appends a single element to the path.
    ///
    /// Fails if `element` is empty or contains a `/`.
    pub fn join(&self, element: &str) -> Result<Path, ParsePathError> {
        if element.is_empty() || element.contains('/') {
            return Err(ParsePathError(ErrorKind::InvalidElement));
        }
        if self.is_root() {
            Ok(Path(format!("/{}", element)))
        } else {
            Ok(Path(format!("{}/{}", self.0, element)))
        }
    }

    /// Returns `true` if this path is `base` itself or lies anywhere below it.
    ///
    /// The comparison is element-wise, so `/ab` is *not* a descendant of `/a`.
    pub fn is_descendant_of(&self, base: &Path) -> bool {
        let mut own = self.elements();
        base.elements().all(|element| own.next() == Some(element))
    }

    /// Returns `true` if this path is `path` itself or one of its ancestors.
    pub fn is_ascendant_of(&self, path: &Path) -> bool {
        path.is_descendant_of(self)
    }

    /// Returns `true` if this path lies exactly one element below `base`.
    pub fn is_child_of(&self, base: &Path) -> bool {
        self.is_descendant_of(base) && self.count_elements() == base.count_elements() + 1
    }

    /// Returns `true` if this path lies exactly one element above `path`.
    pub fn is_parent_of(&self, path: &Path) -> bool {
        path.is_child_of(self)
    }

    /// Returns the immediate child of `base` on the way down to this path.
    ///
    /// Returns `None` if this path is `base` itself or does not lie below it.
    pub fn next_child(&self, base: &Path) -> Option<Path> {
        if !self.is_descendant_of(base) {
            return None;
        }
        let depth = base.count_elements() + 1;
        if self.count_elements() < depth {
            return None;
        }
        Some(self.fetch_elements(depth))
    }

    /// Like [`Path::next_child`], but returns only the element that the child adds to `base`.
    pub fn next_child_strip(&self, base: &Path) -> Option<&str> {
        if !self.is_descendant_of(base) {
            return None;
        }
        self.elements().nth(base.count_elements())
    }

    fn elements(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }
}

fn validate(path: &str) -> Result<(), ParsePathError> {
    if path.is_empty() {
        return Err(ParsePathError(ErrorKind::Empty));
    }
    if !path.starts_with('/') {
        return Err(ParsePathError(ErrorKind::NoLeadingSlash));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(ParsePathError(ErrorKind::TrailingSlash));
    }
    if path.len() > 1 && path[1..].split('/').any(|s| s.is_empty()) {
        return Err(ParsePathError(ErrorKind::EmptyElement));
    }
    Ok(())
}

impl FromStr for Path {
    type Err = ParsePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for Path {
    type Error = ParsePathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for Path {
    type Error = ParsePathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl Default for Path {
    fn default() -> Self {
        Self::root()
    }
}

impl AsRef<str> for Path {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<Path> for String {
    fn from(value: Path) -> Self {
        value.0
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// The error type returned when parsing a malformed [`Path`].
#[derive(Debug)]
pub struct ParsePathError(ErrorKind);

#[derive(Debug)]
enum ErrorKind {
    Empty,
    NoLeadingSlash,
    TrailingSlash,
    EmptyElement,
    InvalidElement,
}

impl fmt::Display for ParsePathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match &self.0 {
            ErrorKind::Empty => "empty object path",
            ErrorKind::NoLeadingSlash => "object path must start with `/`",
            ErrorKind::TrailingSlash => "object path must not end with `/`",
            ErrorKind::EmptyElement => "object path contains an empty element",
            ErrorKind::InvalidElement => "invalid object path element",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ParsePathError {}

use std::fmt;

/// A slash-joined location in the keyed store.
///
/// Paths are plain segment lists; they carry no schema. The typed record
/// layer (`calls::signaling`, `presence`) owns the well-known layouts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailboxPath(Vec<String>);

impl MailboxPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `self` names `other` or one of its ancestors.
    pub fn contains(&self, other: &MailboxPath) -> bool {
        other.0.len() >= self.0.len() && self.0 == other.0[..self.0.len()]
    }
}

impl fmt::Display for MailboxPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

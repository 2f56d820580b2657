//! Dotted / indexed property paths such as `rows[2].cells.title`

use std::fmt;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, ".{}", key),
            PathSegment::Index(index) => write!(f, "[{}]", index),
        }
    }
}

/// Path from a root property down to a nested element
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyPath {
    root: String,
    segments: Vec<PathSegment>,
}

impl PropertyPath {
    pub fn root_only(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            segments: Vec::new(),
        }
    }

    pub fn parse(raw: &str) -> SyncResult<Self> {
        let invalid = |reason: &str| SyncError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let root_end = raw.find(['.', '[']).unwrap_or(raw.len());
        let root = &raw[..root_end];
        if root.is_empty() {
            return Err(invalid("missing root property name"));
        }
        if root.contains(']') {
            return Err(invalid("unexpected ']'"));
        }

        let mut segments = Vec::new();
        let mut rest = &raw[root_end..];
        while !rest.is_empty() {
            if let Some(after_dot) = rest.strip_prefix('.') {
                let end = after_dot.find(['.', '[']).unwrap_or(after_dot.len());
                let key = &after_dot[..end];
                if key.is_empty() {
                    return Err(invalid("empty key segment"));
                }
                segments.push(PathSegment::Key(key.to_string()));
                rest = &after_dot[end..];
            } else if let Some(after_bracket) = rest.strip_prefix('[') {
                let close = after_bracket
                    .find(']')
                    .ok_or_else(|| invalid("unterminated index"))?;
                let index = after_bracket[..close]
                    .parse::<usize>()
                    .map_err(|_| invalid("index is not a non-negative integer"))?;
                segments.push(PathSegment::Index(index));
                rest = &after_bracket[close + 1..];
            } else {
                return Err(invalid("expected '.' or '['"));
            }
        }

        Ok(Self {
            root: root.to_string(),
            segments,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Segments below the root, in root-to-leaf order
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self {
            root: self.root.clone(),
            segments,
        }
    }
}

impl FromStr for PropertyPath {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PropertyPath::parse(s)
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for segment in &self.segments {
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

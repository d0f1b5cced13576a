//! Pointers into the configuration tree under negotiation.
//!
//! A pointer is the path from the root instance down to one node, made of
//! alternating instance and resource segments. Its canonical string form is
//! the segments joined by `/`, each tagged `i:` (instance) or `r:` (resource):
//!
//! ```text
//! i:shop/i:db/r:memory
//! ```

use crate::IdError;

/// What a pointer segment names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SegmentKind {
    Instance,
    Resource,
}

/// One step of a [`Pointer`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
    pub kind: SegmentKind,
    pub name: String,
}

impl Segment {
    pub fn is_instance(&self) -> bool {
        self.kind == SegmentKind::Instance
    }
}

/// Immutable path locating a node of the configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pointer(Vec<Segment>);

impl Pointer {
    /// The pointer of the root instance.
    pub fn root(name: impl Into<String>) -> Self {
        Self(vec![Segment {
            kind: SegmentKind::Instance,
            name: name.into(),
        }])
    }

    /// Pointer to the instance child `name` of this node.
    #[must_use]
    pub fn instance(&self, name: impl Into<String>) -> Self {
        self.child(SegmentKind::Instance, name.into())
    }

    /// Pointer to the resource child `name` of this node.
    #[must_use]
    pub fn resource(&self, name: impl Into<String>) -> Self {
        self.child(SegmentKind::Resource, name.into())
    }

    fn child(&self, kind: SegmentKind, name: String) -> Self {
        let mut segments = self.0.clone();
        segments.push(Segment { kind, name });
        Self(segments)
    }

    /// Drops the last segment. The parent of the root is the empty pointer.
    #[must_use]
    pub fn parent(&self) -> Self {
        let mut segments = self.0.clone();
        segments.pop();
        Self(segments)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn last(&self) -> Option<&Segment> {
        self.0.last()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Parses the canonical string form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Ok(Self::default());
        }

        let segments = s
            .split('/')
            .map(|raw| {
                let (tag, name) = raw
                    .split_once(':')
                    .ok_or_else(|| IdError::InvalidPointer(s.to_string()))?;
                let kind = match tag {
                    "i" => SegmentKind::Instance,
                    "r" => SegmentKind::Resource,
                    _ => return Err(IdError::InvalidPointer(s.to_string())),
                };
                if name.is_empty() {
                    return Err(IdError::InvalidPointer(s.to_string()));
                }
                Ok(Segment {
                    kind,
                    name: name.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self(segments))
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            let tag = match segment.kind {
                SegmentKind::Instance => "i",
                SegmentKind::Resource => "r",
            };
            write!(f, "{}:{}", tag, segment.name)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Pointer {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for Pointer {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Pointer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

use lift_core::EntityKind;
use std::fmt;

/// Target of a remote call: a collection, or one record in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub kind: EntityKind,
    pub id: Option<String>,
}

impl Resource {
    pub fn collection(kind: EntityKind) -> Self {
        Self { kind, id: None }
    }

    pub fn record(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: Some(id.into()),
        }
    }

    /// Path relative to the API base, e.g. `repairs/64f0c`
    pub fn path(&self) -> String {
        match &self.id {
            Some(id) => format!("{}/{}", self.kind.collection(), id),
            None => self.kind.collection().to_string(),
        }
    }

    pub fn parse(path: &str) -> Option<Self> {
        let path = path.trim_matches('/');
        let (collection, id) = match path.split_once('/') {
            Some((collection, id)) if !id.is_empty() && !id.contains('/') => {
                (collection, Some(id.to_string()))
            }
            Some(_) => return None,
            None => (path, None),
        };
        EntityKind::from_collection(collection).map(|kind| Self { kind, id })
    }

    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self::record(self.kind, id)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_parse_back() {
        let record = Resource::record(EntityKind::ChatMessage, "m1");
        assert_eq!(record.path(), "chat-messages/m1");
        assert_eq!(Resource::parse(&record.path()), Some(record));
        assert_eq!(
            Resource::parse("/elevators"),
            Some(Resource::collection(EntityKind::Elevator))
        );
        assert_eq!(Resource::parse("elevators/a/b"), None);
        assert_eq!(Resource::parse("widgets"), None);
    }
}

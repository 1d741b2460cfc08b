use std::collections::BTreeSet;

use crate::firestore::model::FieldPath;

/// Set of field paths touched by a patch; a path is covered when any mask
/// entry is a prefix of it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    pub fn union_with(&mut self, other: &FieldMask) {
        self.fields.extend(other.fields.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn covers_nested_paths() {
        let mask = FieldMask::new(vec![path("a"), path("b.c")]);
        assert!(mask.covers(&path("a.x")));
        assert!(mask.covers(&path("b.c")));
        assert!(!mask.covers(&path("b")));
    }

    #[test]
    fn union_deduplicates() {
        let mut mask = FieldMask::new(vec![path("a")]);
        mask.union_with(&FieldMask::new(vec![path("a"), path("b")]));
        assert_eq!(mask.len(), 2);
    }
}

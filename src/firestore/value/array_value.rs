use crate::firestore::value::FirestoreValue;

/// Ordered list of field values. Membership uses value equality, so `1`
/// and `1.0` are different elements.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|candidate| candidate == needle)
    }

    pub fn contains_any(&self, needles: &ArrayValue) -> bool {
        needles.values.iter().any(|needle| self.contains(needle))
    }

    /// Appends each element not already present, keeping existing order.
    pub fn union(mut self, elements: &[FirestoreValue]) -> Self {
        for element in elements {
            if !self.contains(element) {
                self.values.push(element.clone());
            }
        }
        self
    }

    /// Drops every occurrence of each element.
    pub fn without(mut self, elements: &[FirestoreValue]) -> Self {
        self.values
            .retain(|candidate| !elements.iter().any(|element| element == candidate));
        self
    }
}

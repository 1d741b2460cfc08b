use std::fmt::{Display, Formatter};

use crate::firestore::constants::DEFAULT_DATABASE_ID;

/// Project and database a client is bound to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    /// The `(default)` database of `project_id`.
    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `projects/{project}/databases/{database}`, sent as the `database`
    /// field of stream requests and in routing headers.
    pub fn resource_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }

    pub fn documents_root(&self) -> String {
        format!("{}/documents", self.resource_name())
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.resource_name())
    }
}

//! Offline-first sync engine for Cloud Firestore clients.
//!
//! Writes apply to a local cache right away and are replayed against the
//! backend over a persistent write stream; queries are answered from the
//! cache and kept current by a persistent watch stream. The
//! [`firestore::FirestoreClient`] ties the pieces together on a single
//! serialized queue.
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use firebase_sync_rs::firestore::{FirestoreClient, FirestoreSettings, FirestoreValue};
//! use firebase_sync_rs::firestore::remote::InMemoryConnection;
//!
//! # async fn run() -> firebase_sync_rs::firestore::FirestoreResult<()> {
//! let (connection, _backend) = InMemoryConnection::pair();
//! let client = FirestoreClient::builder(FirestoreSettings::default(), connection)
//!     .build()
//!     .await?;
//! let mut data = BTreeMap::new();
//! data.insert("title".to_string(), FirestoreValue::from_string("hello"));
//! let acknowledged = client.set_doc("notes/first", data, None).await?;
//! # drop(acknowledged);
//! # Ok(())
//! # }
//! ```

pub mod firestore;
pub mod platform;
pub mod util;

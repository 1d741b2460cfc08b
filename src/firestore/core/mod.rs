//! Query model, views and the engine that keeps them in sync.

pub mod document_set;
pub mod event_manager;
pub mod filter;
pub mod order_by;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod view;
pub mod view_snapshot;

pub use document_set::DocumentSet;
pub use event_manager::{
    EventManager, ListenOptions, ListenerId, QueryListener, QueryTargetRegistry, SnapshotObserver,
    SnapshotsInSyncObserver,
};
pub use filter::{CompositeOperator, FieldFilter, Filter, FilterOperator};
pub use order_by::{Bound, Direction, OrderBy};
pub use query::{LimitType, Query};
pub use sync_engine::{RemoteCommand, SyncEngine, SyncEngineEvent, WriteCompletion};
pub use target::{Target, TargetId};
pub use view::{LimboDocumentChange, SyncState, View, ViewChange};
pub use view_snapshot::{ChangeType, DocumentViewChange, ViewSnapshot};

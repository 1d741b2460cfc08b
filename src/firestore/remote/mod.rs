pub mod bloom_filter;
pub mod connection;
pub mod online_state;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
mod structured_query;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use connection::{
    AcceptedStream, Connection, InMemoryBackend, InMemoryConnection, StreamHandle, StreamHeaders,
    StreamKind,
};
pub use online_state::{OnlineState, OnlineStateTracker};
pub use persistent_stream::{PersistentStream, StreamAction, StreamGeneration, StreamState};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, RemoteStoreSettings};
pub use remote_syncer::RemoteSyncer;
pub use serializer::{JsonProtoSerializer, WriteResponse};
pub use watch_change::{decode_watch_change, TargetChangeState, WatchChange};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};

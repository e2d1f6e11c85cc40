//! Connector synchronization and query virtualization for HR compliance
//! sources (employees, surveys, training events).
//!
//! A [`Connector`] keeps a TTL-cached snapshot of one remote system fresh
//! through scheduled full/incremental syncs and push invalidations, and
//! answers structured filters and restricted SQL against it.

pub mod analytics;
pub mod cache;
pub mod config;
pub mod connector;
pub mod domains;
pub mod error;
pub mod events;
pub mod http_client;
pub mod query;
pub mod realtime;
pub mod record;
pub mod remote;
pub mod retry;
pub mod schema;
mod singleflight;
pub mod sync;
pub mod tasks;
#[cfg(any(test, feature = "test_support"))]
pub mod test_support;
pub mod transform;

pub use analytics::{AggFunc, Analyze, AnalyticsReport};
pub use cache::{CacheEntry, CacheManager, CacheStats, Invalidation};
pub use config::{load_config, parse_config, Config, ConnectorConfig};
pub use connector::{
    build_connector, Connector, ConnectorRegistry, ConnectorStatus, DynConnector,
};
pub use domains::{Employees, Surveys, TrainingEvents};
pub use error::{ChannelError, ConnectorError, RemoteError, TransformError};
pub use query::{
    CompareOp, Filter, Predicate, QueryAst, QueryResult, ResultSet, ResultSource, SelectItem,
};
pub use realtime::{ChangeNotification, PushTransport, SocketState, Subscription};
pub use record::{CanonicalRecord, Domain, DomainKind};
pub use remote::{Cursor, FetchRequest, HttpSource, RemoteSource};
pub use retry::{RetryExecutor, RetryPolicy};
pub use schema::{ColumnDef, SemanticType, TableSchema};
pub use sync::{SyncMode, SyncOutcome, SyncReport, SyncState, SyncStatus};

/*
    statehive-core - reactive, versioned key-value state

    - `store`: versioned map, snapshots, computed graph, notifications, the `Store` facade
    - `hooks`: plugins, access control gate, audit log
    - `persist`: storage adapters, record format, transforms, write-behind coordinator
    - `sync`: offline queue, conflict strategies, remote replicas, sync engine
*/

pub mod config;
pub mod hooks;
pub mod logging;
pub mod metrics;
pub mod persist;
pub mod store;
pub mod sync;

pub use config::Config;
pub use hooks::{AccessRule, BeforeSet, HookContext, Permission, Plugin, PluginContext, TransactionPhase};
pub use logging::{init_logging, LogLevel};
pub use persist::{FileStorage, MemoryStorage, StorageAdapter};
pub use store::{
    registry, ChangeEvent, ChangeKind, ErrorContext, SetOptions, Snapshot, Store, StoreBuilder, StoreError,
    StoreResult, Subscription, Tracker, WatchEvent,
};
pub use sync::{ConflictInfo, ConflictStrategy, HttpRemote, MemoryRemote, SyncError, SyncRemote, SyncReport};

/*
    Sync subsystem

    Pending-change queue, conflict strategies, the remote replica contract
    and the engine that reconciles the two. `harness` serves a
    `MemoryRemote` over HTTP.
*/

pub mod conflict;
pub mod engine;
pub mod error;
pub mod harness;
pub mod queue;
pub mod remote;

pub use conflict::{ConflictInfo, ConflictStrategy, MergeFn, Resolution};
pub use engine::{KeySyncError, SyncCallback, SyncEngine, SyncReport};
pub use error::{SyncError, SyncResult};
pub use queue::{KeyState, PendingChange};
pub use remote::{HttpRemote, MemoryRemote, PushAck, PushRequest, RemoteVersion, SyncRemote};

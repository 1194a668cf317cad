/*
    Persistence subsystem

    Storage adapters, the on-disk record format, payload transforms and the
    write-behind coordinator used by `Store::flush_disk` / `Store::hydrate`.
*/

pub mod adapter;
pub mod coordinator;
pub mod record;
pub mod transform;

pub use adapter::{FileStorage, MemoryStorage, StorageAdapter};
pub use coordinator::{FlushReport, HydrationReport, MigrateFn, PersistenceCoordinator};
pub use record::StorageRecord;
pub use transform::{Base64Transform, EncryptionTransform, TransformKind, ValueTransform};

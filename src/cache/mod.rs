//! Local object cache and the sync logic around it.
//!
//! - `Store` mirrors server entities in SQLite, insert-or-replace by id
//! - `SyncLayer` refreshes REST resources cache-first and applies pushed frames
//! - `LiveQuery` keeps a filtered, sorted view current and reports change sets

mod layer;
mod live;
mod predicate;
mod resource;
mod storage;
mod traits;

pub use layer::{Applied, SyncLayer};
pub use live::{diff, ChangeSet, LiveQuery};
pub use predicate::{compare_values, lookup, search, Filter, Predicate, SortDescriptor};
pub use resource::Resource;
pub use storage::{CachedResource, Record, Store, StoreChange, Stored};
pub use traits::{CacheResult, CacheSource, Cacheable};

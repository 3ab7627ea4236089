//! A persistent, concurrent hash map stored in memory-mapped files.
//!
//! Keys live in a Robin Hood open-addressing table whose slots are split
//! into chunks, each guarded by its own lock and version counter. Writers
//! lock only the chunks their probe crosses; readers validate chunk
//! versions instead of locking. Variable-size keys and values are appended
//! to a separate value log.
//!
//! ```no_run
//! use mapped_robin::{Store, StoreOptions};
//!
//! # fn main() -> mapped_robin::Result<()> {
//! let store: Store<u64, String> = Store::open("users.tbl", StoreOptions::with_capacity(10_000))?;
//! store.add(&1, &"ada".to_string())?;
//! assert_eq!(store.get(&1)?, "ada");
//! store.dispose()?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod data_file;
mod error;
mod hash;
mod mapping;
mod store;
mod table;

pub use codec::Codec;
pub use config::{Concurrency, ReadMode, StoreOptions, TableGeometry};
pub use data_file::{DataFile, DataFileHeader, ValueView, DATA_MAGIC};
pub use error::{Error, Result};
pub use hash::{AHash, HashFunction, IdentityHash, XxHash};
pub use mapping::{allocation_granularity, MappingSession, MemoryMapper, MemoryMapping};
pub use store::{data_file_path, Store, StoreStats};
pub use table::layout::{RecordShape, TableHeader, TABLE_MAGIC};
pub use table::StatsSnapshot;

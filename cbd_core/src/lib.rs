pub mod cache;
pub mod changes;
pub mod config;
pub mod counters;
pub mod device;
pub mod error;
pub mod format;
pub mod layout;
pub mod snapshot;
pub mod store;

pub use cache::CounterCache;
pub use changes::{ChangeSummary, ChangedBlocks};
pub use config::DeviceConfig;
pub use counters::CounterBlock;
pub use device::{CounterBlockDevice, RevalidateReport};
pub use error::{CbdError, Result};
pub use format::{ByteOrder, Header, Version, BLOCK_SIZE};
pub use layout::{Layout, PhysicalAddr};
pub use snapshot::{SegmentBaseline, Snapshot};
pub use store::BlockStore;

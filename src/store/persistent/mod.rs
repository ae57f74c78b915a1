//! File-backed container storage.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 FileContainer                  │
//! ├───────────────────────────────────────────────┤
//! │   MemoryContainer (node tree, RwLock)          │
//! │              │ flush                           │
//! │              ↓                                 │
//! │   codec frame: magic, version, JSON, CRC32     │
//! │              │ temp file, fsync, rename        │
//! │              ↓                                 │
//! │   <output>          OutputLock <output>.lock   │
//! └───────────────────────────────────────────────┘
//! ```

mod codec;
mod file;
mod output_lock;

pub use file::FileContainer;

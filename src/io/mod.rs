//! Stream sources.
//!
//! Every decoder reads through [`RangeReader`], a positional byte-range trait,
//! so it never learns whether the bytes come from memory, a local file or an
//! object store.

mod block_cache;
mod memory;
mod range_reader;
mod s3_reader;
mod seekable;

pub use block_cache::{BlockCache, DEFAULT_BLOCK_CACHE_CAPACITY, DEFAULT_BLOCK_SIZE};
pub use memory::MemoryRangeReader;
pub use range_reader::{
    read_at_most, read_i32_le, read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be,
    read_u64_le, RangeReader, SharedSource,
};
pub use s3_reader::{create_s3_client, is_s3_uri, parse_s3_uri, S3RangeReader};
pub use seekable::SeekableReader;

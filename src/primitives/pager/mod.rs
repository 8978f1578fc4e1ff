#![forbid(unsafe_code)]

mod meta;
mod pager;

pub use meta::{read_meta_page, write_meta_page, Meta};
pub use pager::{wal_path, Pager, PagerOptions, PagerStats, Synchronous};

//! Physical memory management: the generic range allocator, the physical
//! page frame table, and the offset-keyed page cache built on top of both.

pub mod arena;
pub mod page;
pub mod page_cache;

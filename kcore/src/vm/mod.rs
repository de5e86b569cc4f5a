//! Per-process virtual memory: regions, page sources, and the address
//! space that composes them (§4.G).

pub mod address_space;
pub mod region;
pub mod source;

pub use address_space::AddressSpace;
pub use region::Region;
pub use source::PageSource;

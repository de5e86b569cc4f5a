//! Host-side scenario test support for `kcore`: software arch/MMU/timer
//! fakes a test can install once, then drive the library through its
//! public API exactly as a real port would.

pub mod support;

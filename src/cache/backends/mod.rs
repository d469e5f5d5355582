//! Cache store backends.
//!
//! Each backend implements [`CacheStore`](crate::cache::CacheStore) for any
//! cloneable value type.
//!
//! # Available Backends
//!
//! | Backend | Module | Status |
//! |---------|--------|--------|
//! | In-process concurrent map | [`memory`] | Available |
//! | Disk / distributed store | `disk` | Future |

pub mod memory;

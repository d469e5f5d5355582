//! Graph source backends.
//!
//! Each backend implements [`GraphSource`](crate::source::GraphSource).
//!
//! # Available Backends
//!
//! | Backend | Module | Status |
//! |---------|--------|--------|
//! | JSON snapshot file | [`snapshot`] | Available |
//! | In-process data | [`memory`] | Available |
//! | Live twin service API | `remote` | Future |

pub mod memory;
pub mod snapshot;

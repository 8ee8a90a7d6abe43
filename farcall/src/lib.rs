//! farcall: browser-facing RPC over HTTP and WebSocket.
//!
//! This facade crate re-exports [`farcall_core`] through a single dependency.
//! Import everything you need with:
//!
//! ```ignore
//! use farcall::prelude::*;
//! ```

pub extern crate farcall_core;

// Re-export everything from farcall-core at the top level for convenience.
pub use farcall_core::*;

pub mod prelude {
    pub use farcall_core::prelude::*;
}

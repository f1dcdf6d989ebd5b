//! Link implementations bundled with the crate.
//!
//! Production links (USB, IP tunnelling) live in their own crates; what is
//! here exists to wire up tests, examples, and scenario suites.

mod bus;
pub use bus::{Bus, BusLink};

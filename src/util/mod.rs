//! Small support utilities.

pub mod arena;

pub use arena::{Arena, ArenaIndex};

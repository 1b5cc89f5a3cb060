//! Wire types shared by the Murmur relay crates.

pub mod events;
pub mod models;

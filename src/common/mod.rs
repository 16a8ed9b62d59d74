//! Miscellaneous common structs used throughout the library.

mod id;
mod peer;
mod routing_table;

pub use id::*;
pub use peer::*;
pub use routing_table::*;

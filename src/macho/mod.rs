//! Mach-O format support: constants, on-disk structures, and the owned
//! load-command representation used by the image.

pub mod commands;
pub mod constants;
pub mod structs;

pub use commands::{LoadCommand, PathCommand, SegmentCommand};
pub use constants::*;
pub use structs::*;

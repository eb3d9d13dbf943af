#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod cli;
pub mod code;
pub mod error;
pub mod file;
pub mod logging;
pub mod patcher;
pub mod protect;
pub mod session;
pub mod window;

pub use error::{Error, Result};
pub use region::Protection;
pub use window::MemoryRegion;

//! Container runtime implementations.

pub mod process;

pub use self::process::ProcessRuntime;

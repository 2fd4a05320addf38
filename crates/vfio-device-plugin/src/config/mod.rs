pub mod cli;
pub mod file;

pub use cli::*;
pub use file::*;

pub mod cli;
pub mod kubernetes;

pub use cli::*;
pub use kubernetes::*;

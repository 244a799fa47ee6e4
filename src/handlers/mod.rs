pub mod call;
pub mod config;

pub use call::*;
pub use config::*;

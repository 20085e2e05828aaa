pub mod config;
pub mod sample;
pub mod wire;

pub use config::*;
pub use sample::*;
pub use wire::*;

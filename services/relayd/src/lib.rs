pub mod config;
pub mod console;

pub use config::Config;
pub use console::{Command, CommandError, Directions, Flow};

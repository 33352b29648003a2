pub mod daemon;
pub mod downloads;
pub mod paths;
mod persist;
pub mod registry;
pub mod scanner;

// Core infrastructure modules
pub mod core;
pub mod config;
pub mod driver;

// Service modules
pub mod classifier;
pub mod cli;
pub mod protocol;
pub mod session;

#[cfg(test)]
mod test_utils;

// Core infrastructure modules
pub mod core;

// Settings and composition root
pub mod config;
pub mod services;

// Clients of the database service
pub mod messages;
pub mod options;

#[cfg(test)]
mod test_utils;

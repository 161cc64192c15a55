pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod exec;
pub mod files;
pub mod provision;
pub mod socket;
pub mod telemetry;
pub mod transport;
pub mod tree;

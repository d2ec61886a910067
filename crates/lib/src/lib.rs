//! DevProxy core library: config, bootstrap, the gateway pipeline (auth, validation,
//! execution, audit) and the relay client, shared by the CLI and desktop panel.

pub mod audit;
pub mod auth;
pub mod client;
pub mod config;
pub mod exec;
pub mod gateway;
pub mod init;
pub mod validate;

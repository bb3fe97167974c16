pub mod agent;
pub mod config;
pub mod events;
pub mod executor;
pub mod master;
pub mod spool;
pub mod terminal;

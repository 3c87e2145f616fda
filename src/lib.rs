pub mod agent;
pub mod app;
pub mod automation;
pub mod cli;
pub mod config;
pub mod events;
pub mod invite;
pub mod mcp;
pub mod signing;
pub mod status;
pub mod transcription;

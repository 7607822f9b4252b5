pub mod auth;
pub mod config;
pub mod email;
pub mod llm;
pub mod network;
pub mod shared;
pub mod tickets;
pub mod triage;

// ABOUTME: Library root for the submission server
// ABOUTME: Exposes the authoritative input log and the HTTP router

pub mod log;
pub mod server;

pub use log::{InputLog, LogError, PgInputLog};
pub use server::router;

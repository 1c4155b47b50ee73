pub mod config;
pub mod engine;
pub mod error;
pub mod language;
pub mod limits;
pub mod routes;
pub mod sandbox;
pub mod stats;
pub mod web_server;
pub mod workspace;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub mod chat;
pub mod documents;
pub mod health;
pub mod ingest;
pub mod quiz;
pub mod rate;

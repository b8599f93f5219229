//! # Storage Module
//!
//! Durable local history of chats and text messages.
//!
//! The history store is independent of the relay path: a failed write is
//! logged by the caller and never blocks queueing or delivery.

mod database;
pub mod schema;

pub use database::{ChatRecord, Database, MessageRecord};

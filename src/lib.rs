//! Polls Twitch and Twitter for tracked accounts and keeps Discord
//! notifications in step with what happens upstream.

pub mod checkers;
pub mod config;
pub mod db;
pub mod delivery;
pub mod dispatch;
pub mod embeds;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod mention;
pub mod model;
pub mod platforms;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

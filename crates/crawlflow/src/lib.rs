pub mod admin;
pub mod cache;
pub mod catalogue;
pub mod clock;
pub mod config;
pub mod context;
pub mod crawl;
pub mod crawl_id;
pub mod db;
pub mod error;
pub mod fetch;
pub mod jobs;
pub mod logging;
pub mod notify;
pub mod planner;
pub mod retry;
pub mod sequencer;
pub mod session;
pub mod sink;

pub mod cloud;
pub mod config;
pub mod controller;
pub mod error;
pub mod ingest;
pub mod mqtt;
pub mod poller;
pub mod protocol;
pub mod reconcile;
pub mod sample;
pub mod schema;
pub mod shutdown;
pub mod stats;
pub mod storage;
pub mod writer;

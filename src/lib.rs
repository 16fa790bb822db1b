pub mod artifacts;
pub mod browser;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod fsutil;
pub mod ledger;
pub mod orchestrator;
pub mod parser;
pub mod reprocess;
pub mod sink;

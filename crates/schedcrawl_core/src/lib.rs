pub mod config;
pub mod crawl;
pub mod error;
pub mod model;
pub mod normalize;
pub mod query;
pub mod remote;
pub mod runtime;
pub mod store;

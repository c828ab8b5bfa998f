pub mod cache;
pub mod coalesce;
pub mod config;
pub mod engine;
pub mod invalidation;
pub mod limits;
pub mod model;
pub mod observability;
pub mod source;
pub mod sql;
pub mod sweeper;
pub mod wire;

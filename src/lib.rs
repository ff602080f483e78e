mod auth;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod observability;
pub mod sql;
pub mod studio;
pub mod tls;
pub mod wal;
pub mod wire;

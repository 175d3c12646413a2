pub mod api_key;
pub mod audit_log;
pub mod config;
pub mod controller;
pub mod domain;
pub mod http;
pub mod version;

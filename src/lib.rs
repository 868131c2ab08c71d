// Library for tests to access modules

pub mod config;
pub mod error;
pub mod host;
pub mod models;
pub mod poller;
pub mod rates;
pub mod routes;
pub mod version;
pub mod virsh;

pub mod api_proxy;
pub mod config;
pub mod datastore;
pub mod environment;
pub mod errors;
pub mod fixture;
pub mod interception;
pub mod logging;
pub mod runtime;

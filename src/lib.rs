pub mod common;
pub mod http_client;
pub mod model;
pub mod requests;

pub mod api;
pub mod config;
pub mod device_service_client;
pub mod error;
pub mod http_client;
pub mod pages;
pub mod server_control;
pub mod services;
pub mod supervisor;

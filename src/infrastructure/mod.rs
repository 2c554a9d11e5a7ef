// Infrastructure layer - External dependencies and adapters
pub mod config;
pub mod csv_export;
pub mod cycle_catalog;
pub mod http_response;
pub mod simulated_load;

// Application layer - Session control, polling and scripted runs
pub mod controller;
pub mod cycle_executor;
pub mod error;
pub mod health_monitor;
pub mod instrument;
pub mod link;
pub mod poller;
pub mod session_state;
pub mod test_monitor;

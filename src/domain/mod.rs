// Domain layer - Values shared by every other layer
pub mod cycle;
pub mod session;
pub mod telemetry;

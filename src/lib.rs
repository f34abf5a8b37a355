//! Real-time driver dispatch: a live spatial index of driver positions and a
//! matching engine that reserves the closest available driver for a rider
//! without ever handing one driver to two concurrent requests.

pub mod api;      // HTTP endpoint handlers
pub mod audit;    // Audit trail of match attempts and outcomes
pub mod config;   // Configuration management
pub mod error;    // Error types and handling
pub mod fleet;    // Driver registry and spatial index
pub mod matching; // Match orchestration
pub mod models;   // Request/response bodies
pub mod service;  // Service wiring and background sweep

//! Redoubt game server library.
//!
//! The authoritative core of a real-time-strategy game server: a lockstep
//! frame scheduler with keyframe sync checking, adaptive speed control
//! driven by live network metrics, a redundant multi-transport connection
//! layer with UDP fallback, and an autohost side channel for external game
//! controllers. Simulation and gameplay stay outside; they only exchange
//! opaque packets with this crate.

pub mod config;
pub mod metrics;
pub mod net;
pub mod server;

//! LevSwap Library
//!
//! Rotates a Trading 212 account between a leveraged ETF and its 1x
//! counterpart on a divergence signal.

pub mod broker;
pub mod calendar;
pub mod config;
pub mod notifier;
pub mod persistence;
pub mod runner;
pub mod signal;
pub mod trader;
pub mod types;

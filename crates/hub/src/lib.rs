//! Irrigation session and schedule engine.
//!
//! A site waters either because someone started a manual run of N litres or
//! because the weekly schedule has a window open right now. Manual runs are
//! persisted and logged; scheduled runs are derived from the schedule on
//! every tick.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod flow;
pub mod model;
pub mod resolver;
pub mod retry;
pub mod state;
pub mod store;
pub mod web;

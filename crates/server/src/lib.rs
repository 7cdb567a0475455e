//! Pen plotter control service: keeps a plotter connected, runs plots on it
//! and streams what happens to every connected browser.

pub mod api;
pub mod app_state;
pub mod commands;
pub mod config;
pub mod engine;
pub mod hub;
pub mod supervisor;
pub mod wake_lock;

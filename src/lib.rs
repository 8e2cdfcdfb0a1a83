//! camhls - live HLS session supervisor
//!
//! Starts one transcoder process per live camera stream, tracks it in a
//! registry, stops it on request or when its lifetime runs out, and removes
//! its output directory once the process is gone.

pub mod api;
pub mod config;
pub mod janitor;
mod monitor;
pub mod process;
pub mod reaper;
pub mod session;
pub mod source;
pub mod stats;
pub mod supervisor;

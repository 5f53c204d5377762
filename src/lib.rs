pub mod canvas;
pub mod clip;
pub mod config;
pub mod crashlog;
pub mod error;
pub mod ffmpeg;
pub mod merge;
pub mod planner;
pub mod probe;
pub mod progress;
pub mod runner;
pub mod tier;
pub mod util;

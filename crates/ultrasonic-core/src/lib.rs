pub mod broadcast;
pub mod config;
pub mod dsp;
pub mod frame;
pub mod registry;
pub mod throttle;
pub mod util;

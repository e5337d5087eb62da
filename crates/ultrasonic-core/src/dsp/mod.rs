pub mod spectrum;
pub mod window;

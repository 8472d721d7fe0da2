//! Configuration module for the function emulator.
//!
//! Settings are read from `EMULATOR_`-prefixed environment variables using
//! the `envy` crate.

mod app;

pub use app::AppConfig;

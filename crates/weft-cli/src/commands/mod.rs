//! Command implementations for the weft CLI
//!
//! Each command module handles the CLI interface and delegates to the
//! weft crate for actual implementation.

pub mod check;
pub mod render;

use weft::Engine;

/// Engine configured from shared CLI flags.
pub fn build_engine(base: Option<String>) -> Engine {
    let mut engine = Engine::new();
    if let Some(base) = base {
        engine.set_base_location(base);
    }
    engine
}

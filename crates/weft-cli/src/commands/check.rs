//! `weft check` - validate a template page without rendering it

use anyhow::{Context, Result};

use super::build_engine;

pub fn execute(template: &str, base: Option<String>) -> Result<()> {
    let engine = build_engine(base);
    engine
        .check(template)
        .with_context(|| format!("checking `{template}`"))?;
    println!("{template}: OK");
    Ok(())
}

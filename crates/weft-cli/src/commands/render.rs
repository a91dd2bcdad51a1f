//! `weft render` - render a template page to stdout or a file

use std::fs;
use std::io::Write;

use anyhow::{Context, Result};
use tracing::debug;
use weft::Value;

use super::build_engine;

pub fn execute(
    template: &str,
    context: Option<&str>,
    output: Option<&str>,
    base: Option<String>,
) -> Result<()> {
    let engine = build_engine(base);

    let root = match context {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading context file `{path}`"))?;
            let json: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing context file `{path}`"))?;
            Value::from(json)
        }
        None => Value::Null,
    };

    debug!(template, "rendering");
    let rendered = engine
        .render_with_context(template, root)
        .with_context(|| format!("rendering `{template}`"))?;

    match output {
        Some("-") | None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(rendered.as_bytes())?;
        }
        Some(path) => {
            fs::write(path, &rendered).with_context(|| format!("writing `{path}`"))?;
        }
    }
    Ok(())
}

use anyhow::Result;
use std::io::Write;

use crate::state::Session;

/// Export session to JSON
pub fn export_json<W: Write>(session: &Session, writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, session)?;
    Ok(())
}

//! Tabular summaries of what a command did.

use std::io::Write;

use anyhow::Result;
use tabwriter::TabWriter;

use crate::k8s::{ReconcileResult, ResourceList};

/// Write one row per touched object, created first, then updated, then deleted.
pub fn write_result<W: Write>(writer: W, result: &ReconcileResult) -> Result<()> {
	let mut tw = TabWriter::new(writer).padding(2);
	writeln!(tw, "ACTION\tKIND\tNAMESPACE\tNAME")?;
	write_rows(&mut tw, "created", &result.created)?;
	write_rows(&mut tw, "updated", &result.updated)?;
	write_rows(&mut tw, "deleted", &result.deleted)?;
	tw.flush()?;
	Ok(())
}

fn write_rows<W: Write>(tw: &mut TabWriter<W>, action: &str, resources: &ResourceList) -> Result<()> {
	for info in resources {
		writeln!(
			tw,
			"{action}\t{}\t{}\t{}",
			info.id.kind,
			info.id.namespace.as_deref().unwrap_or("-"),
			info.id.name
		)?;
	}
	Ok(())
}

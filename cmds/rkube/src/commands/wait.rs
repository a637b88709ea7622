//! Wait command handler.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tracing::instrument;

use super::util::{ClusterArgs, Session, WaitArgs};

/// Condition to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum WaitFor {
	/// Every object exists and is ready.
	#[default]
	Ready,

	/// Every object is gone.
	Deleted,

	/// Like `ready`, but honored by the hookOnly strategy too.
	Hooks,
}

#[derive(Args, Debug, Clone)]
pub struct WaitCommandArgs {
	/// Manifests of the objects to wait for (`-` for stdin)
	pub path: PathBuf,

	#[arg(long = "for", value_enum, default_value_t)]
	pub condition: WaitFor,

	#[command(flatten)]
	pub wait_args: WaitArgs,

	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Run the wait command.
pub async fn run<W: Write>(args: WaitCommandArgs, writer: W) -> Result<()> {
	let session = Session::open(&args.cluster).await?;
	execute(&args, session, writer).await
}

/// Run the wait command against an open session.
#[instrument(skip_all, fields(path = %args.path.display(), condition = ?args.condition))]
pub async fn execute<W: Write>(args: &WaitCommandArgs, mut session: Session, mut writer: W) -> Result<()> {
	let resources = session.load(&args.path).await?;
	let timeout = session.prepare_wait(&args.wait_args).await?;

	let waited = match args.condition {
		WaitFor::Ready => session.engine.wait(&resources, timeout).await,
		WaitFor::Deleted => session.engine.wait_for_delete(&resources, timeout).await,
		WaitFor::Hooks => session.engine.watch_until_ready(&resources, timeout).await,
	};
	waited.with_context(|| format!("waiting for {} object(s)", resources.len()))?;

	writeln!(
		writer,
		"{} object(s) {}",
		resources.len(),
		match args.condition {
			WaitFor::Deleted => "deleted",
			WaitFor::Ready | WaitFor::Hooks => "ready",
		}
	)?;
	Ok(())
}

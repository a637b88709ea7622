//! Update command handler.
//!
//! Reconciles the cluster from a previously applied manifest set to a new one:
//! new objects are created, existing ones patched, and objects that left the
//! set are deleted.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::instrument;

use super::{
	output::write_result,
	util::{ClusterArgs, Session, WaitArgs},
};

#[derive(Args, Debug, Clone)]
pub struct UpdateArgs {
	/// Manifests describing the desired state (`-` for stdin)
	pub target: PathBuf,

	/// Manifests applied last time. Objects only listed here are deleted.
	/// When unset the target is taken as its own previous state and nothing is deleted
	#[arg(long)]
	pub previous: Option<PathBuf>,

	/// Replace objects instead of patching them
	#[arg(long)]
	pub force: bool,

	/// Wait for the target objects to become ready
	#[arg(long)]
	pub wait: bool,

	#[command(flatten)]
	pub wait_args: WaitArgs,

	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Run the update command.
pub async fn run<W: Write>(args: UpdateArgs, writer: W) -> Result<()> {
	let session = Session::open(&args.cluster).await?;
	execute(&args, session, writer).await
}

/// Run the update command against an open session.
#[instrument(skip_all, fields(target = %args.target.display(), force = args.force))]
pub async fn execute<W: Write>(args: &UpdateArgs, mut session: Session, mut writer: W) -> Result<()> {
	let mut target = session.load(&args.target).await?;
	let original = match &args.previous {
		Some(previous) => session.load(previous).await?,
		None => target.clone(),
	};
	tracing::debug!(original = original.len(), target = target.len(), "loaded manifests");

	let result = session.engine.update(&original, &mut target, args.force).await;
	let result = match result {
		Ok(result) => result,
		Err(partial) => {
			write_result(&mut writer, &partial.result)?;
			return Err(partial.error).context("updating objects");
		}
	};
	write_result(&mut writer, &result)?;

	if args.wait && !target.is_empty() {
		let timeout = session.prepare_wait(&args.wait_args).await?;
		session
			.engine
			.wait(&target, timeout)
			.await
			.context("waiting for objects to become ready")?;
	}

	Ok(())
}

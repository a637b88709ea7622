//! Create command handler.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::instrument;

use super::{
	output::write_result,
	util::{ClusterArgs, Session, WaitArgs},
};

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
	/// Manifests of the objects to create (`-` for stdin)
	pub path: PathBuf,

	/// Wait for the created objects to become ready
	#[arg(long)]
	pub wait: bool,

	#[command(flatten)]
	pub wait_args: WaitArgs,

	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Run the create command.
pub async fn run<W: Write>(args: CreateArgs, writer: W) -> Result<()> {
	let session = Session::open(&args.cluster).await?;
	execute(&args, session, writer).await
}

/// Run the create command against an open session.
#[instrument(skip_all, fields(path = %args.path.display()))]
pub async fn execute<W: Write>(args: &CreateArgs, mut session: Session, mut writer: W) -> Result<()> {
	let mut resources = session.load(&args.path).await?;
	if resources.is_empty() {
		eprintln!("No objects to create.");
		return Ok(());
	}

	match session.engine.create(&mut resources).await {
		Ok(result) => write_result(&mut writer, &result)?,
		Err(partial) => {
			write_result(&mut writer, &partial.result)?;
			return Err(partial.error).context("creating objects");
		}
	}

	if args.wait {
		let timeout = session.prepare_wait(&args.wait_args).await?;
		session
			.engine
			.wait(&resources, timeout)
			.await
			.context("waiting for objects to become ready")?;
	}

	Ok(())
}

//! Delete command handler.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::instrument;

use super::{
	output::write_result,
	util::{ClusterArgs, Session, WaitArgs},
};
use crate::k8s::DeletionPropagation;

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
	/// Manifests of the objects to delete (`-` for stdin)
	pub path: PathBuf,

	/// What happens to dependents of deleted objects
	#[arg(long, value_enum, default_value_t)]
	pub cascade: DeletionPropagation,

	/// Wait until the objects are gone
	#[arg(long)]
	pub wait: bool,

	#[command(flatten)]
	pub wait_args: WaitArgs,

	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Run the delete command.
pub async fn run<W: Write>(args: DeleteArgs, writer: W) -> Result<()> {
	let session = Session::open(&args.cluster).await?;
	execute(&args, session, writer).await
}

/// Run the delete command against an open session.
#[instrument(skip_all, fields(path = %args.path.display(), cascade = ?args.cascade))]
pub async fn execute<W: Write>(args: &DeleteArgs, mut session: Session, mut writer: W) -> Result<()> {
	let resources = session.load(&args.path).await?;
	if resources.is_empty() {
		eprintln!("No objects to delete.");
		return Ok(());
	}

	let result = match session
		.engine
		.delete_with_propagation(&resources, args.cascade)
		.await
	{
		Ok(result) => result,
		Err(partial) => {
			write_result(&mut writer, &partial.result)?;
			return Err(partial.error).context("deleting objects");
		}
	};
	write_result(&mut writer, &result)?;

	if args.wait {
		let timeout = session.prepare_wait(&args.wait_args).await?;
		session
			.engine
			.wait_for_delete(&result.deleted, timeout)
			.await
			.context("waiting for objects to be deleted")?;
	}

	Ok(())
}

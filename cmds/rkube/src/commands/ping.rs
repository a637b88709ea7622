//! Ping command handler.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;

use super::util::{ClusterArgs, Session};

#[derive(Args, Debug, Clone, Default)]
pub struct PingArgs {
	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Run the ping command.
pub async fn run<W: Write>(args: PingArgs, writer: W) -> Result<()> {
	let session = Session::open(&args.cluster).await?;
	execute(session, writer).await
}

/// Check that the session's cluster answers and report its version.
pub async fn execute<W: Write>(mut session: Session, mut writer: W) -> Result<()> {
	let cluster = session.connection().cluster_identifier().to_string();
	session
		.engine
		.is_reachable()
		.await
		.with_context(|| format!("pinging {cluster}"))?;
	let version = session
		.connection()
		.server_version()
		.await
		.with_context(|| format!("reading server version of {cluster}"))?;
	writeln!(writer, "{cluster} is reachable (Kubernetes {})", version.git_version)?;
	Ok(())
}

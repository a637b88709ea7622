//! Utilities for command handlers.

use std::{
	env, fs,
	io::{self, ErrorKind, Read, Write},
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use anyhow::{Context, Result};
use clap::Args;

use crate::{
	config::RkubeConfig,
	k8s::{
		client::{ClusterConnection, ConnectionOptions},
		mapper::KubeMapper,
		wait::WaitStrategy,
		FieldManager, ReconcileEngine, ResourceList,
	},
};

/// Flags shared by every command talking to a cluster.
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
	/// Kubeconfig context to use instead of the current one
	#[arg(long)]
	pub context: Option<String>,

	/// Namespace for namespaced objects that declare none
	#[arg(short = 'n', long)]
	pub namespace: Option<String>,

	/// Name recorded as the owner of written fields. Defaults to the executable name
	#[arg(long)]
	pub field_manager: Option<String>,

	/// Configuration file. Searched upward from the working directory when unset
	#[arg(long)]
	pub config: Option<PathBuf>,
}

impl ClusterArgs {
	pub fn load_config(&self) -> Result<RkubeConfig> {
		if let Some(path) = &self.config {
			return RkubeConfig::load_from_file(path);
		}
		let cwd = env::current_dir().context("getting current directory")?;
		Ok(RkubeConfig::load_from_directory(&cwd)?.unwrap_or_default())
	}

	fn connection_options(&self, config: &RkubeConfig) -> ConnectionOptions {
		ConnectionOptions {
			context: self.context.clone().or_else(|| config.context.clone()),
			namespace: self.namespace.clone().or_else(|| config.namespace.clone()),
		}
	}
}

/// Flags controlling how long and how to wait for objects.
#[derive(Args, Debug, Clone, Default)]
pub struct WaitArgs {
	/// How to tell when objects are ready
	#[arg(long, value_enum)]
	pub wait_strategy: Option<WaitStrategy>,

	/// Give up waiting after this many seconds
	#[arg(long)]
	pub timeout: Option<u64>,
}

/// An engine bound to a cluster, with flags and the config file merged.
pub struct Session {
	pub engine: ReconcileEngine,
	pub config: RkubeConfig,
	connection: ClusterConnection,
}

impl Session {
	/// Load the config file and connect through the kubeconfig.
	pub async fn open(args: &ClusterArgs) -> Result<Self> {
		let config = args.load_config()?;
		let connection = ClusterConnection::connect(&args.connection_options(&config))
			.await
			.context("connecting to Kubernetes cluster")?;
		Ok(Self::new(connection, args, config))
	}

	/// Bind an engine to an established connection. Flags override `config`.
	pub fn new(connection: ClusterConnection, args: &ClusterArgs, config: RkubeConfig) -> Self {
		let namespace = args
			.namespace
			.clone()
			.or_else(|| config.namespace.clone())
			.unwrap_or_else(|| connection.default_namespace().to_string());
		let field_manager = args
			.field_manager
			.as_deref()
			.or(config.field_manager.as_deref())
			.map_or_else(FieldManager::from_process, FieldManager::new);
		tracing::debug!(cluster = %connection.cluster_identifier(), %namespace, %field_manager, "opening session");

		let engine = ReconcileEngine::builder()
			.mapper(Arc::new(KubeMapper::new(connection.client().clone(), namespace)))
			.cluster(Arc::new(connection.clone()))
			.field_manager(field_manager)
			.retry(config.retry_policy())
			.maybe_wait_strategy(config.wait_strategy)
			.build();

		Self {
			engine,
			config,
			connection,
		}
	}

	pub fn connection(&self) -> &ClusterConnection {
		&self.connection
	}

	/// Apply the wait flags to the engine and return the timeout to use.
	pub async fn prepare_wait(&mut self, args: &WaitArgs) -> Result<Duration> {
		if let Some(strategy) = args.wait_strategy {
			self.engine
				.set_waiter(strategy)
				.await
				.with_context(|| format!("setting up {strategy} waiter"))?;
		}
		Ok(args
			.timeout
			.map_or_else(|| self.config.timeout(), Duration::from_secs))
	}

	/// Read and resolve the manifests at `path` (`-` for stdin).
	pub async fn load(&self, path: &Path) -> Result<ResourceList> {
		let manifests = read_manifests(path)?;
		self.engine
			.build(&manifests)
			.await
			.with_context(|| format!("building objects from {}", path.display()))
	}
}

/// Read a manifest file, or stdin when `path` is `-`.
pub fn read_manifests(path: &Path) -> Result<Vec<u8>> {
	if path == Path::new("-") {
		let mut buf = Vec::new();
		io::stdin()
			.read_to_end(&mut buf)
			.context("reading manifests from stdin")?;
		return Ok(buf);
	}
	fs::read(path).with_context(|| format!("reading manifests from {}", path.display()))
}

/// A writer wrapper that silently handles broken pipe errors.
///
/// When the underlying writer returns a broken pipe error (EPIPE), this wrapper
/// converts it to a successful write. This allows commands to exit cleanly when
/// output is piped to a process that closes early (e.g., `rkube update x.yaml | head -1`).
pub struct BrokenPipeGuard<W> {
	inner: W,
}

impl<W> BrokenPipeGuard<W> {
	pub fn new(inner: W) -> Self {
		Self { inner }
	}
}

impl<W: Write> Write for BrokenPipeGuard<W> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self.inner.write(buf) {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(buf.len()),
			other => other,
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self.inner.flush() {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
			other => other,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use indoc::indoc;
	use tempfile::TempDir;

	use super::*;

	struct ClosedPipe;

	impl Write for ClosedPipe {
		fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
			Err(io::Error::from(ErrorKind::BrokenPipe))
		}

		fn flush(&mut self) -> io::Result<()> {
			Err(io::Error::from(ErrorKind::BrokenPipe))
		}
	}

	#[test]
	fn test_broken_pipe_is_swallowed() {
		let mut guard = BrokenPipeGuard::new(ClosedPipe);
		assert_eq!(guard.write(b"abc").unwrap(), 3);
		guard.flush().unwrap();
	}

	#[test]
	fn test_flags_override_config_file() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("custom.yaml");
		fs::write(
			&path,
			indoc! {"
				context: from-file
				namespace: file-ns
			"},
		)
		.unwrap();

		let args = ClusterArgs {
			namespace: Some("flag-ns".to_string()),
			config: Some(path),
			..Default::default()
		};
		let config = args.load_config().unwrap();
		let options = args.connection_options(&config);

		assert_eq!(options.context.as_deref(), Some("from-file"));
		assert_eq!(options.namespace.as_deref(), Some("flag-ns"));
	}

	#[test]
	fn test_read_manifests_missing_file() {
		let err = read_manifests(Path::new("/nonexistent/manifests.yaml")).unwrap_err();
		assert!(err.to_string().contains("/nonexistent/manifests.yaml"));
	}
}

//! Kubernetes cluster connection management.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::{
	config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
	Client, Config,
};
use thiserror::Error;
use tracing::instrument;

/// Default timeout for Kubernetes API requests.
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error("no context named `{0}` was found. Please check your $KUBECONFIG")]
	ContextNotFound(String),

	#[error("no Kubernetes cluster is configured")]
	NotConfigured,

	#[error(transparent)]
	Kubeconfig(#[from] KubeconfigError),

	#[error(transparent)]
	Kube(#[from] kube::Error),
}

/// Which kubeconfig context to use, and overrides on top of it.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
	/// Kubeconfig context. The current context when unset.
	pub context: Option<String>,
	/// Namespace overriding the context's default namespace.
	pub namespace: Option<String>,
}

/// A connection to a Kubernetes cluster.
#[derive(Clone)]
pub struct ClusterConnection {
	client: Client,
	/// Human-readable identifier for the cluster (context name or API server URL).
	cluster_identifier: String,
}

impl std::fmt::Debug for ClusterConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterConnection")
			.field("cluster_identifier", &self.cluster_identifier)
			.finish_non_exhaustive()
	}
}

impl ClusterConnection {
	/// Connect using `$KUBECONFIG` or `~/.kube/config`.
	#[instrument(skip_all)]
	pub async fn connect(options: &ConnectionOptions) -> Result<Self, ConnectionError> {
		let kubeconfig = Kubeconfig::read()?;
		Self::from_kubeconfig(kubeconfig, options).await
	}

	/// Connect using a provided kubeconfig.
	///
	/// No request is made; use [`ClusterConnection::server_version`] to check the server.
	#[instrument(skip_all, fields(context = ?options.context))]
	pub async fn from_kubeconfig(
		kubeconfig: Kubeconfig,
		options: &ConnectionOptions,
	) -> Result<Self, ConnectionError> {
		if let Some(context) = &options.context {
			if !kubeconfig.contexts.iter().any(|c| &c.name == context) {
				return Err(ConnectionError::ContextNotFound(context.clone()));
			}
		}

		let context_name = options
			.context
			.clone()
			.or_else(|| kubeconfig.current_context.clone());

		let mut config = Config::from_custom_kubeconfig(
			kubeconfig,
			&KubeConfigOptions {
				context: options.context.clone(),
				..Default::default()
			},
		)
		.await?;

		let cluster_identifier = match context_name {
			Some(context) => format!("{}  (context:{})", config.cluster_url, context),
			None => config.cluster_url.to_string(),
		};

		if let Some(namespace) = &options.namespace {
			config.default_namespace = namespace.clone();
		}
		config.read_timeout = Some(DEFAULT_API_TIMEOUT);
		let client = Client::try_from(config)?;

		tracing::debug!(cluster = %cluster_identifier, "configured cluster connection");

		Ok(Self {
			client,
			cluster_identifier,
		})
	}

	pub fn client(&self) -> &Client {
		&self.client
	}

	/// Get the default namespace from the current context.
	pub fn default_namespace(&self) -> &str {
		self.client.default_namespace()
	}

	/// Get the cluster identifier (context name or API server URL).
	pub fn cluster_identifier(&self) -> &str {
		&self.cluster_identifier
	}

	/// Ask the server for its version.
	pub async fn server_version(&self) -> Result<Info, ConnectionError> {
		Ok(self.client.apiserver_version().await?)
	}
}

/// Source of API clients for components that connect lazily.
#[async_trait]
pub trait ClusterFactory: Send + Sync {
	async fn kube_client(&self) -> Result<Client, ConnectionError>;
}

#[async_trait]
impl ClusterFactory for ClusterConnection {
	async fn kube_client(&self) -> Result<Client, ConnectionError> {
		Ok(self.client.clone())
	}
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rkube::{
	commands::{self, util::BrokenPipeGuard},
	telemetry,
};
use tracing::Level;

#[cfg(all(
	target_os = "linux",
	feature = "mimalloc",
	not(feature = "system-alloc")
))]
#[global_allocator]
static GLOBAL: mimallocator::Mimalloc = mimallocator::Mimalloc;

#[derive(Parser)]
#[command(name = "rkube")]
#[command(about = "Reconcile Kubernetes objects against manifests", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
	/// Log level (error, warn, info, debug, trace). Takes priority over RUST_LOG
	#[arg(long, global = true)]
	log_level: Option<Level>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Move the cluster from the previous manifests to the target ones
	Update(commands::update::UpdateArgs),

	/// Create the objects of a manifest file
	Create(commands::create::CreateArgs),

	/// Delete the objects of a manifest file
	Delete(commands::delete::DeleteArgs),

	/// Wait for the objects of a manifest file
	Wait(commands::wait::WaitCommandArgs),

	/// Check that the cluster is reachable
	Ping(commands::ping::PingArgs),
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("creating tokio runtime")?;

	runtime.block_on(async {
		let _telemetry = telemetry::init(cli.log_level)?;
		let stdout = BrokenPipeGuard::new(std::io::stdout());

		match cli.command {
			Commands::Update(args) => commands::update::run(args, stdout).await,
			Commands::Create(args) => commands::create::run(args, stdout).await,
			Commands::Delete(args) => commands::delete::run(args, stdout).await,
			Commands::Wait(args) => commands::wait::run(args, stdout).await,
			Commands::Ping(args) => commands::ping::run(args, stdout).await,
		}
	})
}

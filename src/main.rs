use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;

use triage_sync::api::ApiClient;
use triage_sync::cache::{Store, SyncLayer};
use triage_sync::config::Config;
use triage_sync::daemon::{cached_patients, Daemon};
use triage_sync::logging;
use triage_sync::model::{Patient, PriorityCounts};

#[derive(Parser, Debug)]
#[command(name = "triage-sync")]
#[command(about = "Keeps a local triage cache in sync with the server")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/triage-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Scene to follow, overriding the config
  #[arg(short, long)]
  scene: Option<String>,

  /// Agency subdomain, overriding the config
  #[arg(long)]
  subdomain: Option<String>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sync until interrupted (default)
  Run,
  /// Print cached patients without touching the network
  Show {
    /// Only patients matching every word in name, PIN or location
    #[arg(long)]
    search: Option<String>,
  },
  /// Drop every cached entity
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(scene) = args.scene {
    config.sync.scene = Some(scene);
  }
  if let Some(subdomain) = args.subdomain {
    config.server.subdomain = subdomain;
  }

  let _guard = logging::init(config.log.file.as_deref())?;

  let store = Arc::new(Store::open(&config.cache.resolve_path()?)?);

  match args.command.unwrap_or(Command::Run) {
    Command::Run => {
      let client = ApiClient::new(&config.server, Config::get_api_token())?;
      let sync = SyncLayer::new(client, store).with_stale_time(config.sync.stale_time());
      let mut daemon = Daemon::new(config, sync)?;
      daemon.run().await?;
    }
    Command::Show { search } => {
      let scene = config.sync.scene.as_deref();
      let patients = cached_patients(&store, scene, search.as_deref())?;
      for patient in &patients {
        println!("{}", format_patient(patient));
      }
      println!("{}", PriorityCounts::from_patients(&patients));
    }
    Command::Clear => {
      let removed = store.clear_all()?;
      println!("Removed {} cached entities", removed);
    }
  }

  Ok(())
}

fn format_patient(patient: &Patient) -> String {
  format!(
    "{:<10} {:<8} {:<24} {}",
    patient.priority,
    patient.pin.as_deref().unwrap_or("-"),
    patient.full_name(),
    patient.location.as_deref().unwrap_or("")
  )
}

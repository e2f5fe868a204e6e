use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use chrome_manager::window_placement::{Display, Rect};
use chrome_manager::{
  extension_manager::ExtensionManager, profile::ProfileManager, proxy_storage, registry,
  BrowserRunner, LaunchOptions, ProxyScheme, StoredProxy,
};

#[derive(Parser)]
#[command(
  name = "chrome-manager",
  about = "Profile-isolated Chrome instance orchestration",
  version
)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Manage browser profiles
  Profile {
    #[command(subcommand)]
    command: ProfileCommands,
  },
  /// Manage upstream proxies
  Proxy {
    #[command(subcommand)]
    command: ProxyCommands,
  },
  /// Manage unpacked extensions
  Extension {
    #[command(subcommand)]
    command: ExtensionCommands,
  },
  /// Launch a profile and supervise it until Ctrl-C
  Launch {
    /// Profile id or name
    #[arg(long)]
    profile: String,
    /// Override the profile's stored proxy for this launch
    #[arg(long)]
    proxy: Option<String>,
    /// Display work area, e.g. 1920x1080 or 1920x1080+1920+0 (repeatable)
    #[arg(long = "display", value_parser = parse_display)]
    displays: Vec<Display>,
    /// Browser executable override
    #[arg(long)]
    browser: Option<PathBuf>,
  },
}

#[derive(Subcommand)]
enum ProfileCommands {
  /// Create a profile (allocates its state directory)
  Create {
    #[arg(long)]
    name: String,
    #[arg(long)]
    proxy: Option<String>,
    #[arg(long)]
    note: Option<String>,
  },
  List,
  /// Delete a profile and its entire state directory
  Delete { id: uuid::Uuid },
  /// Re-point a profile at a stored proxy (omit --proxy to clear)
  SetProxy {
    id: uuid::Uuid,
    #[arg(long)]
    proxy: Option<String>,
  },
}

#[derive(Subcommand)]
enum ProxyCommands {
  Add {
    #[arg(long, default_value = "")]
    label: String,
    #[arg(long)]
    host: String,
    #[arg(long)]
    port: u16,
    #[arg(long, default_value = "http")]
    scheme: ProxyScheme,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
  },
  List,
  Remove { id: String },
}

#[derive(Subcommand)]
enum ExtensionCommands {
  /// Register an unpacked extension directory
  Add {
    #[arg(long)]
    path: PathBuf,
    #[arg(long)]
    name: Option<String>,
  },
  List,
  Remove { id: String },
}

fn parse_display(s: &str) -> Result<Display, String> {
  let (size, position) = match s.split_once('+') {
    Some((size, rest)) => {
      let (x, y) = rest
        .split_once('+')
        .ok_or_else(|| format!("expected WxH+X+Y, got '{s}'"))?;
      (
        size,
        (
          x.parse::<i32>().map_err(|e| e.to_string())?,
          y.parse::<i32>().map_err(|e| e.to_string())?,
        ),
      )
    }
    None => (s, (0, 0)),
  };

  let (w, h) = size
    .split_once('x')
    .ok_or_else(|| format!("expected WxH, got '{size}'"))?;

  Ok(Display {
    work_area: Rect {
      x: position.0,
      y: position.1,
      width: w.parse().map_err(|e: std::num::ParseIntError| e.to_string())?,
      height: h.parse().map_err(|e: std::num::ParseIntError| e.to_string())?,
    },
    // The first display given on the command line is the primary.
    is_primary: false,
  })
}

fn resolve_profile_id(input: &str) -> Result<uuid::Uuid, Box<dyn std::error::Error + Send + Sync>> {
  if let Ok(id) = input.parse::<uuid::Uuid>() {
    return Ok(id);
  }
  Ok(ProfileManager::instance().get_profile_by_name(input)?.id)
}

async fn supervise_until_interrupt() {
  let mut known_active: HashSet<String> = registry()
    .snapshot()
    .await
    .into_iter()
    .filter(|s| s.is_active)
    .map(|s| s.instance_id)
    .collect();

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        log::info!("Interrupted, stopping all instances");
        registry().stop_all().await;
        return;
      }
      _ = tokio::time::sleep(Duration::from_secs(2)) => {
        let snapshot = registry().snapshot().await;
        for instance in &snapshot {
          if !instance.is_active && known_active.remove(&instance.instance_id) {
            println!("instance {} disconnected", instance.instance_id);
          }
        }
        if snapshot.iter().all(|s| !s.is_active) {
          println!("all instances closed");
          return;
        }
      }
    }
  }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  let cli = Cli::parse();
  if let Err(e) = run(cli).await {
    log::error!("{e}");
    std::process::exit(1);
  }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
  match cli.command {
    Commands::Profile { command } => match command {
      ProfileCommands::Create { name, proxy, note } => {
        if let Some(proxy_id) = &proxy {
          if proxy_storage::get_proxy(proxy_id).is_none() {
            return Err(format!("Proxy '{proxy_id}' not found").into());
          }
        }
        let profile = ProfileManager::instance().create_profile(&name, proxy, note)?;
        println!("{}", serde_json::to_string_pretty(&profile)?);
      }
      ProfileCommands::List => {
        let profiles = ProfileManager::instance().list_profiles()?;
        println!("{}", serde_json::to_string_pretty(&profiles)?);
      }
      ProfileCommands::Delete { id } => {
        ProfileManager::instance().delete_profile(&id).await?;
        println!("deleted {id}");
      }
      ProfileCommands::SetProxy { id, proxy } => {
        let profile = ProfileManager::instance().update_profile_proxy(&id, proxy)?;
        println!("{}", serde_json::to_string_pretty(&profile)?);
      }
    },

    Commands::Proxy { command } => match command {
      ProxyCommands::Add {
        label,
        host,
        port,
        scheme,
        username,
        password,
      } => {
        let proxy = StoredProxy::new(&label, &host, port, scheme).with_credentials(username, password);
        proxy_storage::save_proxy(&proxy)?;
        println!("{}", serde_json::to_string_pretty(&proxy)?);
      }
      ProxyCommands::List => {
        let proxies = proxy_storage::list_proxies();
        println!("{}", serde_json::to_string_pretty(&proxies)?);
      }
      ProxyCommands::Remove { id } => {
        if proxy_storage::delete_proxy(&id) {
          println!("removed {id}");
        } else {
          return Err(format!("Proxy '{id}' not found").into());
        }
      }
    },

    Commands::Extension { command } => match command {
      ExtensionCommands::Add { path, name } => {
        let ext = ExtensionManager::instance().add_extension(name, &path)?;
        println!("{}", serde_json::to_string_pretty(&ext)?);
      }
      ExtensionCommands::List => {
        let extensions = ExtensionManager::instance().list_extensions()?;
        println!("{}", serde_json::to_string_pretty(&extensions)?);
      }
      ExtensionCommands::Remove { id } => {
        ExtensionManager::instance().delete_extension(&id)?;
        println!("removed {id}");
      }
    },

    Commands::Launch {
      profile,
      proxy,
      mut displays,
      browser,
    } => {
      if let Some(first) = displays.first_mut() {
        first.is_primary = true;
      }
      let profile_id = resolve_profile_id(&profile)?;
      let options = LaunchOptions {
        displays,
        executable: browser,
      };

      let summary = BrowserRunner::instance()
        .launch_profile(&profile_id, proxy, &options)
        .await?;
      println!("{}", serde_json::to_string_pretty(&summary)?);

      supervise_until_interrupt().await;
    }
  }

  Ok(())
}

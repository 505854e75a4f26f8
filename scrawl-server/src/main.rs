//! scrawl-server: hosts shared annotation sessions.
//!
//! ```text
//! scrawl-server [serve] [--port N] [--storage DIR] [--autosave-interval SECS]
//!                       [--credentials USER:PASSWORD]... [--allow-anyone]
//! scrawl-server migrate [--storage DIR]
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use scrawl_collab::auth::{AllowAnyone, Authenticator, CredentialTable};
use scrawl_collab::server::{ServerConfig, SyncServer, DEFAULT_AUTOSAVE_INTERVAL, DEFAULT_PORT};
use scrawl_collab::storage::{self, StorageConfig};

const DEFAULT_STORAGE_DIR: &str = ".scrawl";

#[derive(Parser, Debug)]
#[command(name = "scrawl-server", version, about = "Shared PDF annotation server")]
struct Cli {
    /// Document directory (default: ~/.scrawl, created if missing).
    #[arg(long, global = true, value_name = "DIR")]
    storage: Option<PathBuf>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (the default).
    Serve(ServeArgs),
    /// Convert documents saved in the old binary format.
    Migrate,
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0", value_name = "ADDR")]
    bind: String,

    /// Seconds between saves of changed documents; 0 keeps everything in memory.
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_AUTOSAVE_INTERVAL.as_secs())]
    autosave_interval: u64,

    /// Account allowed to log in (repeatable).
    #[arg(long = "credentials", value_name = "USER:PASSWORD", conflicts_with = "allow_anyone")]
    credentials: Vec<String>,

    /// Accept any username and password.
    #[arg(long)]
    allow_anyone: bool,
}

impl ServeArgs {
    fn authenticator(&self) -> Result<Option<Arc<dyn Authenticator>>> {
        if self.allow_anyone {
            log::warn!("Accepting any login");
            return Ok(Some(Arc::new(AllowAnyone)));
        }
        if self.credentials.is_empty() {
            return Ok(None);
        }
        let mut table = CredentialTable::new();
        for entry in &self.credentials {
            let Some((user, password)) = CredentialTable::parse_entry(entry) else {
                bail!("invalid credentials {entry:?}, expected USER:PASSWORD");
            };
            table.insert(user, password);
        }
        Ok(Some(Arc::new(table)))
    }

    fn server_config(&self, storage: StorageConfig) -> Result<ServerConfig> {
        let mut config = ServerConfig {
            bind_addr: format!("{}:{}", self.bind, self.port),
            storage: Some(storage),
            autosave_interval: Duration::from_secs(self.autosave_interval),
            ..ServerConfig::default()
        };
        match self.authenticator()? {
            Some(auth) => config.authenticator = auth,
            None => log::warn!("No --credentials given; only the built-in test account can log in"),
        }
        Ok(config)
    }
}

impl Cli {
    fn storage(&self) -> Result<StorageConfig> {
        match &self.storage {
            Some(dir) => Ok(StorageConfig::new(dir)),
            None => {
                let home = dirs::home_dir().context("cannot determine home directory; pass --storage")?;
                Ok(StorageConfig::default_location(home.join(DEFAULT_STORAGE_DIR)))
            }
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let storage = cli.storage()?;

    match &cli.command {
        Some(Command::Migrate) => {
            if storage.create_if_missing && !storage.dir.exists() {
                log::info!("{} does not exist; nothing to migrate", storage.dir.display());
                return Ok(());
            }
            let report = storage::migrate_legacy(&storage.dir)
                .with_context(|| format!("migrating {}", storage.dir.display()))?;
            for name in &report.converted {
                println!("converted {name}");
            }
            for name in &report.skipped {
                println!("skipped {name} (already current)");
            }
            println!(
                "{} document(s) converted, {} skipped",
                report.converted.len(),
                report.skipped.len()
            );
        }
        Some(Command::Serve(args)) => serve(args, storage).await?,
        None => serve(&cli.serve, storage).await?,
    }
    Ok(())
}

async fn serve(args: &ServeArgs, storage: StorageConfig) -> Result<()> {
    let config = args.server_config(storage)?;
    log::info!("Starting with {config:?}");
    let server = SyncServer::bind(config).await.context("server startup failed")?;
    let report = server.run().await?;
    log::info!(
        "Stopped: {} document(s) saved, {} failed",
        report.saved,
        report.failed
    );
    if report.failed > 0 {
        bail!("{} document(s) could not be saved", report.failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["scrawl-server"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.port, DEFAULT_PORT);
        assert_eq!(cli.serve.autosave_interval, 60);
        assert!(cli.serve.credentials.is_empty());

        let config = cli
            .serve
            .server_config(StorageConfig::new("/tmp/scrawl-test"))
            .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:6524");
        assert!(config.authenticator.authenticate("test", "testpw"));
    }

    #[test]
    fn test_credentials_replace_default_account() {
        let cli = Cli::try_parse_from([
            "scrawl-server",
            "serve",
            "--credentials",
            "ann:s3cret",
            "--credentials",
            "bob:a:b",
        ])
        .unwrap();
        let Some(Command::Serve(args)) = &cli.command else {
            panic!("expected serve");
        };
        let config = args.server_config(StorageConfig::new("/tmp/x")).unwrap();
        assert!(config.authenticator.authenticate("ann", "s3cret"));
        assert!(config.authenticator.authenticate("bob", "a:b"));
        assert!(!config.authenticator.authenticate("test", "testpw"));
    }

    #[test]
    fn test_bad_credentials_rejected() {
        let cli = Cli::try_parse_from(["scrawl-server", "--credentials", "nopassword"]).unwrap();
        assert!(cli.serve.server_config(StorageConfig::new("/tmp/x")).is_err());
    }

    #[test]
    fn test_allow_anyone_conflicts_with_credentials() {
        assert!(Cli::try_parse_from(["scrawl-server", "--allow-anyone", "--credentials", "a:b"]).is_err());

        let cli = Cli::try_parse_from(["scrawl-server", "--allow-anyone"]).unwrap();
        let config = cli.serve.server_config(StorageConfig::new("/tmp/x")).unwrap();
        assert!(config.authenticator.authenticate("anyone", ""));
    }

    #[test]
    fn test_explicit_storage_is_not_created() {
        let cli = Cli::try_parse_from(["scrawl-server", "migrate", "--storage", "/srv/scrawl"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Migrate)));
        let storage = cli.storage().unwrap();
        assert_eq!(storage.dir, PathBuf::from("/srv/scrawl"));
        assert!(!storage.create_if_missing);
    }

    #[test]
    fn test_zero_autosave_parses() {
        let cli = Cli::try_parse_from(["scrawl-server", "--autosave-interval", "0", "--port", "7000"]).unwrap();
        let config = cli.serve.server_config(StorageConfig::new("/tmp/x")).unwrap();
        assert!(config.autosave_interval.is_zero());
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
    }

    #[tokio::test]
    async fn test_migrate_then_serve_loads_documents() {
        let dir = tempfile::tempdir().unwrap();
        let pages = vec![scrawl_core::Page::new()];
        let legacy = storage::legacy::encode_legacy(&pages).unwrap();
        std::fs::write(dir.path().join("doc-old.save"), legacy).unwrap();

        let report = storage::migrate_legacy(dir.path()).unwrap();
        assert_eq!(report.converted, vec!["old"]);

        let config = ServerConfig::for_testing().with_storage(dir.path());
        let server = SyncServer::bind(config).await.unwrap();
        assert_eq!(server.document_names(), vec!["old"]);
    }
}

use crate::errors::{Error, Result};
use crate::managers::configs::{ConfigArchive, ConfigBackups, ConfigEntry};
use crate::managers::swarm::SwarmManager;
use crate::services::blob_store::{BlobStore, DirectoryBlobStore};
use crate::services::command::{CommandExecutor, EchoMode};
use crate::services::compose::StackFile;
use crate::services::echo::{Echo, TerminalEcho};
use crate::services::engine::ObjectApi;
use crate::services::inventory::{HostDiscovery, StaticInventory};
use crate::services::settings::Settings;
use crate::services::shell::Connector;
use crate::services::ssh_session::SshConnector;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "swarmlink")]
#[command(about = "Run commands and manage stacks on remote swarm managers", long_about = None)]
pub struct Cli {
    /// Manager host as STACK=DNS; repeatable, added to SWARMLINK_HOSTS
    #[arg(long = "host", value_name = "STACK=DNS", global = true)]
    pub hosts: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List known manager hosts
    Hosts {
        /// Only hosts of this stack
        stack: Option<String>,
    },

    /// Run a command on a manager, echoing its output
    Run {
        swarm: String,
        command: String,
    },

    /// Run a local command with the engine endpoint of a manager exported
    Exec {
        swarm: String,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Manage stacks
    #[command(subcommand)]
    Stack(StackCommand),

    /// Manage swarm secrets
    #[command(subcommand)]
    Secrets(SecretsCommand),

    /// Manage swarm configs and their backups
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
pub enum SecretsCommand {
    /// Create a secret from a file
    Create {
        swarm: String,
        name: String,
        file: PathBuf,
    },

    /// List secrets as ID and name
    Ls { swarm: String },

    /// Remove a secret by id or name
    Rm {
        swarm: String,
        secret: String,

        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Create a config from a file and back it up
    Create {
        swarm: String,
        name: String,
        file: PathBuf,

        /// Skip the backup copy
        #[arg(short = 'n', long)]
        no_backup: bool,
    },

    /// List configs with their backup state
    Ls {
        swarm: String,

        /// Also list backups with no live config
        #[arg(short = 'b', long)]
        all_backups: bool,
    },

    /// Remove configs from the swarm; backups are kept
    Rm {
        swarm: String,

        #[arg(required = true)]
        names: Vec<String>,

        #[arg(short, long)]
        force: bool,
    },

    /// Recreate configs from their backups
    Restore {
        swarm: String,
        names: Vec<String>,

        #[arg(long = "all")]
        restore_all: bool,
    },

    /// Print the backed-up content of a config
    Cat { swarm: String, name: String },
}

#[derive(Debug, Subcommand)]
pub enum StackCommand {
    /// List stack namespaces
    Ls { swarm: Option<String> },

    /// List the services of a stack
    Ps { swarm: String, stack: String },

    /// Remove every service of a stack
    Rm { swarm: String, stack: String },

    /// Create a stack's services from a compose file
    Deploy {
        swarm: String,
        stack: String,
        compose_file: PathBuf,
    },
}

pub struct App {
    discovery: Arc<dyn HostDiscovery>,
    connector: Arc<dyn Connector>,
    echo: Arc<dyn Echo>,
    manager: SwarmManager,
    store: Option<Arc<dyn BlobStore>>,
}

impl App {
    pub fn new(
        settings: Arc<Settings>,
        discovery: Arc<dyn HostDiscovery>,
        connector: Arc<dyn Connector>,
        echo: Arc<dyn Echo>,
    ) -> Self {
        let manager = SwarmManager::new(connector.clone(), settings, echo.clone());
        Self {
            discovery,
            connector,
            echo,
            manager,
            store: None,
        }
    }

    /// Backup store for config copies.
    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Wires the ssh transport, terminal echo and static inventory.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut settings = Settings::from_env()?;
        settings.hosts.extend(cli.hosts.iter().cloned());
        let discovery = StaticInventory::parse(&settings.hosts)?;
        let store = settings
            .backup_dir
            .clone()
            .map(|dir| Arc::new(DirectoryBlobStore::new(dir)) as Arc<dyn BlobStore>);
        let settings = Arc::new(settings);
        let connector = SshConnector::new(settings.clone());
        let app = Self::new(
            settings,
            Arc::new(discovery),
            Arc::new(connector),
            Arc::new(TerminalEcho),
        );
        Ok(match store {
            Some(store) => app.with_store(store),
            None => app,
        })
    }

    /// Runs one command and returns the process exit code.
    pub async fn run(&self, command: Command) -> Result<i32> {
        match command {
            Command::Hosts { stack } => {
                for host in self.discovery.list(stack.as_deref()).await? {
                    println!("{}", host);
                }
                Ok(0)
            }
            Command::Run { swarm, command } => self.run_remote(&swarm, &command).await,
            Command::Exec { swarm, command } => self.exec_local(&swarm, command).await,
            Command::Stack(command) => self.stack(command).await,
            Command::Secrets(command) => self.secrets(command).await,
            Command::Config(command) => self.config(command).await,
        }
    }

    async fn run_remote(&self, swarm: &str, command: &str) -> Result<i32> {
        let host = self.discovery.find(Some(swarm)).await?;
        let connector = self.connector.clone();
        let echo = self.echo.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            let shell = connector.connect(&host)?;
            let executor = CommandExecutor::new(shell.clone(), echo, host.label());
            let status = executor.execute(&command, EchoMode::ALL);
            shell.disconnect();
            status
        })
        .await
        .map_err(|err| Error::execution(format!("remote command task failed: {}", err)))?
    }

    async fn exec_local(&self, swarm: &str, argv: Vec<String>) -> Result<i32> {
        let host = self.discovery.find(Some(swarm)).await?;
        self.manager
            .scoped(host, |handle| async move {
                let (name, value) = handle.command_env();
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| Error::Config("exec needs a command".to_string()))?;
                let status = tokio::process::Command::new(program)
                    .args(args)
                    .env(name, value)
                    .status()
                    .await?;
                Ok::<i32, Error>(status.code().unwrap_or(1))
            })
            .await
    }

    async fn stack(&self, command: StackCommand) -> Result<i32> {
        match command {
            StackCommand::Ls { swarm } => {
                let host = self.discovery.find(swarm.as_deref()).await?;
                let namespaces = self
                    .manager
                    .scoped(host, |handle| async move { handle.stacks().list_stacks().await })
                    .await?;
                for namespace in namespaces {
                    println!("{}", namespace);
                }
            }
            StackCommand::Ps { swarm, stack } => {
                let host = self.discovery.find(Some(swarm.as_str())).await?;
                let summary = self
                    .manager
                    .scoped(host, |handle| async move { handle.stacks().get_stack(&stack).await })
                    .await?;
                for service in summary.services {
                    println!("{}", service);
                }
            }
            StackCommand::Rm { swarm, stack } => {
                let host = self.discovery.find(Some(swarm.as_str())).await?;
                let removed = self
                    .manager
                    .scoped(host, |handle| async move { handle.stacks().remove(&stack).await })
                    .await?;
                for service in removed {
                    println!("{}", service);
                }
            }
            StackCommand::Deploy {
                swarm,
                stack,
                compose_file,
            } => {
                let file = StackFile::parse_file(&compose_file)?;
                let host = self.discovery.find(Some(swarm.as_str())).await?;
                let report = self
                    .manager
                    .scoped(host, |handle| async move {
                        handle.stacks().deploy(&stack, &file).await
                    })
                    .await?;
                for dropped in &report.dropped {
                    eprintln!("dropped unsupported option: {}", dropped);
                }
                for service in &report.created {
                    println!("{}", service);
                }
            }
        }
        Ok(0)
    }

    async fn secrets(&self, command: SecretsCommand) -> Result<i32> {
        match command {
            SecretsCommand::Create { swarm, name, file } => {
                let data = Bytes::from(tokio::fs::read(&file).await?);
                let host = self.discovery.find(Some(swarm.as_str())).await?;
                let id = self
                    .manager
                    .scoped(host, |handle| async move {
                        handle.secrets().create(&name, data).await
                    })
                    .await?;
                println!("{}", id);
            }
            SecretsCommand::Ls { swarm } => {
                let host = self.discovery.find(Some(swarm.as_str())).await?;
                let secrets = self
                    .manager
                    .scoped(host, |handle| async move { handle.secrets().list().await })
                    .await?;
                for secret in secrets {
                    println!("{}\t{}", secret.id, secret.name);
                }
            }
            SecretsCommand::Rm {
                swarm,
                secret,
                force,
            } => {
                let host = self.discovery.find(Some(swarm.as_str())).await?;
                let removed = self
                    .manager
                    .scoped(host, |handle| async move {
                        let secrets = handle.secrets();
                        let target = secrets.find(&secret).await?;
                        if !force && !confirm(&format!("Delete secret \"{}\"", target.name))? {
                            return Ok(false);
                        }
                        secrets.remove(&target.id).await?;
                        Ok(true)
                    })
                    .await?;
                if !removed {
                    eprintln!("Aborted!");
                    return Ok(1);
                }
            }
        }
        Ok(0)
    }

    async fn config(&self, command: ConfigCommand) -> Result<i32> {
        match command {
            ConfigCommand::Create {
                swarm,
                name,
                file,
                no_backup,
            } => {
                let data = Bytes::from(tokio::fs::read(&file).await?);
                let host = self.discovery.find(Some(swarm.as_str())).await?;
                let store = self.store.clone();
                let id = self
                    .manager
                    .scoped(host, |handle| async move {
                        ConfigBackups::new(handle.configs(), store, swarm)
                            .create(&name, data, !no_backup)
                            .await
                    })
                    .await?;
                println!("{}", id);
            }
            ConfigCommand::Ls { swarm, all_backups } => {
                let host = self.discovery.find(Some(swarm.as_str())).await?;
                let store = self.store.clone();
                let entries = self
                    .manager
                    .scoped(host, |handle| async move {
                        ConfigBackups::new(handle.configs(), store, swarm)
                            .list(all_backups)
                            .await
                    })
                    .await?;
                for entry in &entries {
                    println!("{}", format_config(entry));
                }
            }
            ConfigCommand::Rm {
                swarm,
                names,
                force,
            } => {
                if !force && !confirm(&format!("Delete configs {}", names.join(", ")))? {
                    eprintln!("Aborted!");
                    return Ok(1);
                }
                let host = self.discovery.find(Some(swarm.as_str())).await?;
                let store = self.store.clone();
                let removed = self
                    .manager
                    .scoped(host, |handle| async move {
                        ConfigBackups::new(handle.configs(), store, swarm)
                            .remove(&names)
                            .await
                    })
                    .await?;
                for name in removed {
                    println!("{}", name);
                }
            }
            ConfigCommand::Restore {
                swarm,
                names,
                restore_all,
            } => {
                let host = self.discovery.find(Some(swarm.as_str())).await?;
                let store = self.store.clone();
                let report = self
                    .manager
                    .scoped(host, |handle| async move {
                        ConfigBackups::new(handle.configs(), store, swarm)
                            .restore(&names, restore_all)
                            .await
                    })
                    .await?;
                for name in &report.skipped {
                    eprintln!("Warning: Original config {} exists. Skipping restore.", name);
                }
                for name in &report.restored {
                    println!("{}", name);
                }
                println!("Successfully restored {} configs", report.restored.len());
            }
            ConfigCommand::Cat { swarm, name } => {
                let store = self.store.clone().ok_or_else(|| {
                    Error::Config("no backup store configured (set SWARMLINK_BACKUP_DIR)".to_string())
                })?;
                let data = ConfigArchive::new(store, swarm).get(&name).await?;
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
        }
        Ok(0)
    }
}

fn format_config(entry: &ConfigEntry) -> String {
    let modified = entry
        .modified
        .map(|time| time.format("%b %d %H:%M %Y %Z").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} {:<25}  {}  {}",
        entry.backup.mark(),
        entry.id.as_deref().unwrap_or("-"),
        modified,
        entry.name
    )
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{} [y/N]: ", prompt);
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

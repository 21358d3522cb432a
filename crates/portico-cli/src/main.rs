//! Portico CLI - run and administer the gateway and auth service.

mod commands;
mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "portico")]
#[command(about = "Portico - authenticating API gateway")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to <state dir>/portico.json)
    #[arg(short, long, global = true, env = "PORTICO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Gateway operations
    Gateway {
        #[command(subcommand)]
        action: GatewayCommands,
    },

    /// Auth service operations
    Auth {
        #[command(subcommand)]
        action: AuthCommands,
    },

    /// Run the gateway and the auth service in one process
    Serve,

    /// User management against the local auth database
    Admin {
        #[command(subcommand)]
        action: AdminCommands,

        /// Data directory override
        #[arg(long, global = true)]
        data_dir: Option<PathBuf>,
    },

    /// Configuration inspection
    Config {
        #[command(subcommand)]
        action: Option<ConfigCommands>,
    },

    /// Print the route table
    Routes,
}

#[derive(Subcommand)]
enum GatewayCommands {
    /// Start the gateway server
    Run {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check gateway and backend health
    Status,
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Start the auth service
    Run {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Get a configuration value
    Get {
        /// Configuration key (e.g., gateway.port)
        key: String,
    },

    /// Show the effective configuration
    Show,

    /// Validate configuration
    Validate,

    /// Print the config file path
    Path,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create a new user
    Create {
        /// Username for the new user
        #[arg(long)]
        username: String,

        /// Email address
        #[arg(long)]
        email: String,

        /// Password (or use --generate-password)
        #[arg(long)]
        password: Option<String>,

        /// Given name
        #[arg(long, default_value = "Portico")]
        first_name: String,

        /// Family name
        #[arg(long, default_value = "Admin")]
        last_name: String,

        /// Role: director, administrator, or employee
        #[arg(long, default_value = "administrator")]
        role: String,

        /// Department, e.g. informatica
        #[arg(long, default_value = "none")]
        department: String,

        /// Generate a random password
        #[arg(long)]
        generate_password: bool,
    },

    /// List users
    List {
        /// Include deleted accounts
        #[arg(long)]
        all: bool,
    },

    /// Change a user's role
    SetRole {
        /// Username of the user
        #[arg(long)]
        username: String,

        /// New role
        #[arg(long)]
        role: String,
    },

    /// Move a user to another department
    SetDepartment {
        /// Username of the user
        #[arg(long)]
        username: String,

        /// New department
        #[arg(long)]
        department: String,
    },

    /// Suspend a user and revoke their sessions
    Suspend {
        /// Username of the user
        #[arg(long)]
        username: String,
    },

    /// Reactivate a suspended user
    Activate {
        /// Username of the user
        #[arg(long)]
        username: String,
    },

    /// Delete a user (terminal)
    Delete {
        /// Username of the user to delete
        #[arg(long)]
        username: String,
    },

    /// Remove revoked tokens past their expiry
    PurgeTokens,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(false))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init();
    }

    let config_path = cli.config;

    match cli.command {
        Commands::Gateway { action } => {
            let action = match action {
                GatewayCommands::Run { port } => commands::gateway::GatewayAction::Run { port },
                GatewayCommands::Status => commands::gateway::GatewayAction::Status,
            };
            commands::run_gateway(config_path.as_deref(), action).await?;
        }

        Commands::Auth { action } => match action {
            AuthCommands::Run { port } => {
                commands::run_auth(config_path.as_deref(), port).await?;
            }
        },

        Commands::Serve => commands::run_serve(config_path.as_deref()).await?,

        Commands::Admin { action, data_dir } => {
            use commands::admin::AdminAction;

            let action = match action {
                AdminCommands::Create {
                    username,
                    email,
                    password,
                    first_name,
                    last_name,
                    role,
                    department,
                    generate_password,
                } => AdminAction::Create {
                    username,
                    email,
                    password,
                    first_name,
                    last_name,
                    role,
                    department,
                    generate_password,
                },
                AdminCommands::List { all } => AdminAction::List { all },
                AdminCommands::SetRole { username, role } => {
                    AdminAction::SetRole { username, role }
                }
                AdminCommands::SetDepartment {
                    username,
                    department,
                } => AdminAction::SetDepartment {
                    username,
                    department,
                },
                AdminCommands::Suspend { username } => AdminAction::Suspend { username },
                AdminCommands::Activate { username } => AdminAction::Activate { username },
                AdminCommands::Delete { username } => AdminAction::Delete { username },
                AdminCommands::PurgeTokens => AdminAction::PurgeTokens,
            };
            commands::run_admin(commands::admin::AdminArgs {
                action,
                data_dir,
                config: config_path,
            })?;
        }

        Commands::Config { action } => {
            use commands::config::ConfigAction;

            let action = match action {
                Some(ConfigCommands::Get { key }) => ConfigAction::Get(key),
                Some(ConfigCommands::Show) | None => ConfigAction::Show,
                Some(ConfigCommands::Validate) => ConfigAction::Validate,
                Some(ConfigCommands::Path) => ConfigAction::Path,
                Some(ConfigCommands::Init { force }) => ConfigAction::Init { force },
            };
            commands::run_config(config_path.as_deref(), action)?;
        }

        Commands::Routes => commands::run_routes(config_path.as_deref())?,
    }

    Ok(())
}

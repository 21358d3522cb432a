//! Admin user management commands.
//!
//! These open the auth database directly, so the auth service must not be
//! running against the same data directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use portico_core::{Department, Role};
use portico_gateway::auth::{
    AccountStatus, NewUser, TokenKind, TokenLedger, User, UserStore, open_database,
};
use rand::Rng;
use rand::distributions::Alphanumeric;

use super::load_config;
use crate::ui;

/// Arguments for admin commands.
pub struct AdminArgs {
    /// The admin action to perform.
    pub action: AdminAction,
    /// Data directory override.
    pub data_dir: Option<PathBuf>,
    /// Config file override.
    pub config: Option<PathBuf>,
}

/// Admin actions.
pub enum AdminAction {
    /// Create a new user.
    Create {
        username: String,
        email: String,
        password: Option<String>,
        first_name: String,
        last_name: String,
        role: String,
        department: String,
        generate_password: bool,
    },
    /// List users.
    List { all: bool },
    /// Change a user's role.
    SetRole { username: String, role: String },
    /// Change a user's department.
    SetDepartment { username: String, department: String },
    /// Suspend a user.
    Suspend { username: String },
    /// Reactivate a user.
    Activate { username: String },
    /// Delete a user.
    Delete { username: String },
    /// Purge dead tokens.
    PurgeTokens,
}

struct Stores {
    users: UserStore,
    ledger: TokenLedger,
}

/// Run the admin command.
///
/// # Errors
///
/// Returns error if the database cannot be opened or the operation fails.
pub fn run_admin(args: AdminArgs) -> Result<()> {
    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => load_config(args.config.as_deref())?.data_dir(),
    };
    std::fs::create_dir_all(&data_dir)?;

    let db = open_database(&data_dir).with_context(|| {
        format!(
            "Failed to open auth database in {} (is the auth service running?)",
            data_dir.display()
        )
    })?;
    let stores = Stores {
        users: UserStore::new(&db)?,
        ledger: TokenLedger::new(&db)?,
    };

    match args.action {
        AdminAction::Create {
            username,
            email,
            password,
            first_name,
            last_name,
            role,
            department,
            generate_password: gen_pwd,
        } => {
            let password = match (password, gen_pwd) {
                (_, true) => {
                    let pwd = generate_password(16);
                    ui::success(&format!("Generated password: {pwd}"));
                    pwd
                }
                (Some(pwd), false) => pwd,
                (None, false) => anyhow::bail!(
                    "Password required. Use --password or --generate-password"
                ),
            };
            let user = stores.users.create(NewUser {
                username,
                email,
                password,
                first_name,
                last_name,
                job_title: None,
                role: parse_role(&role)?,
                department: parse_department(&department)?,
            })?;
            ui::success(&format!(
                "Created user '{}' (id {}) with role '{}'",
                user.username, user.id, user.role
            ));
        }
        AdminAction::List { all } => list_users(&stores.users, all)?,
        AdminAction::SetRole { username, role } => {
            let user = find(&stores.users, &username)?;
            let user = stores.users.set_role(user.id, parse_role(&role)?)?;
            ui::success(&format!("'{}' is now {}", user.username, user.role));
        }
        AdminAction::SetDepartment {
            username,
            department,
        } => {
            let user = find(&stores.users, &username)?;
            let user = stores
                .users
                .set_department(user.id, parse_department(&department)?)?;
            ui::success(&format!(
                "'{}' moved to {}",
                user.username, user.department
            ));
        }
        AdminAction::Suspend { username } => {
            transition(&stores, &username, AccountStatus::Suspended)?;
        }
        AdminAction::Activate { username } => {
            transition(&stores, &username, AccountStatus::Active)?;
        }
        AdminAction::Delete { username } => {
            transition(&stores, &username, AccountStatus::Deleted)?;
        }
        AdminAction::PurgeTokens => {
            let purged = stores.ledger.purge_expired(Utc::now())?;
            ui::success(&format!("Purged {purged} token(s)"));
            ui::kv("Remaining", &stores.ledger.len().to_string());
        }
    }

    Ok(())
}

fn generate_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn parse_role(s: &str) -> Result<Role> {
    s.parse()
        .map_err(|_| anyhow::anyhow!("Invalid role: {s}. Use: director, administrator, or employee"))
}

fn parse_department(s: &str) -> Result<Department> {
    s.parse()
        .map_err(|_| anyhow::anyhow!("Invalid department: {s}"))
}

fn find(store: &UserStore, username: &str) -> Result<User> {
    store
        .get_by_username(username)?
        .ok_or_else(|| anyhow::anyhow!("User not found: {username}"))
}

fn transition(stores: &Stores, username: &str, to: AccountStatus) -> Result<()> {
    let user = find(&stores.users, username)?;
    stores.users.transition(user.id, to)?;
    if to != AccountStatus::Active {
        let revoked = stores.ledger.revoke_all(user.id, TokenKind::Refresh)?;
        ui::info(&format!("Revoked {revoked} session(s)"));
    }
    ui::success(&format!("'{username}' is now {to}"));
    Ok(())
}

fn list_users(store: &UserStore, all: bool) -> Result<()> {
    let users = store.list(all)?;

    if users.is_empty() {
        ui::info("No users configured.");
        ui::info(
            "Run 'portico admin create --username admin --email admin@example.com --generate-password' to create one.",
        );
        return Ok(());
    }

    ui::info(&format!("Users ({}):", users.len()));
    println!();
    println!(
        "{:<6} {:<20} {:<14} {:<14} {:<10} {:<20}",
        "ID", "USERNAME", "ROLE", "DEPARTMENT", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(88));

    for user in users {
        let created = user.created_at.format("%Y-%m-%d %H:%M:%S");
        println!(
            "{:<6} {:<20} {:<14} {:<14} {:<10} {:<20}",
            user.id, user.username, user.role, user.department, user.status, created
        );
    }

    Ok(())
}

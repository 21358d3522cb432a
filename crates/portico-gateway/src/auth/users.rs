//! User model and storage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use portico_core::validation::{self, FieldErrors, limits};
use portico_core::{Department, ParseTypeError, Role, UserId};
use serde::{Deserialize, Serialize};

use super::AuthError;
use super::password::{hash_password, verify_password};

const USERS_TREE: &str = "users";
const INDEX_TREE: &str = "user_index";

/// Account lifecycle state.
///
/// `active ⇄ suspended`, and either may move to the terminal `deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    /// May authenticate and refresh.
    #[default]
    Active,
    /// Temporarily locked out.
    Suspended,
    /// Soft-deleted. Terminal.
    Deleted,
}

impl AccountStatus {
    /// Get string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Deleted => "deleted",
        }
    }

    /// Whether moving from `self` to `to` is allowed.
    ///
    /// Re-entering the current non-terminal state is a permitted no-op.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Active | Self::Suspended, Self::Active | Self::Suspended | Self::Deleted)
        )
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "deleted" => Ok(Self::Deleted),
            _ => Err(ParseTypeError {
                kind: "account status",
                value: s.to_string(),
            }),
        }
    }
}

/// User account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: UserId,
    /// Username for login (NFKC-normalized, case preserved).
    pub username: String,
    /// Email address (lowercased).
    pub email: String,
    /// Argon2 password hash (never exposed in the public API).
    pub password_hash: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Job title.
    pub job_title: Option<String>,
    /// Role.
    pub role: Role,
    /// Department.
    pub department: Department,
    /// Lifecycle state.
    pub status: AccountStatus,
    /// When the user last logged in.
    pub last_login: Option<DateTime<Utc>>,
    /// When the user was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Verify a password against this user's hash.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials` if the password doesn't match.
    pub fn verify_password(&self, password: &str) -> Result<(), AuthError> {
        verify_password(password, &self.password_hash)
    }

    /// Whether the account may authenticate.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Create a safe version of user for API responses (no password hash).
    #[must_use]
    pub fn to_public(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            job_title: self.job_title.clone(),
            role: self.role,
            department: self.department,
            status: self.status,
            last_login: self.last_login,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Public user representation (for API responses).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    /// Unique user ID.
    pub id: UserId,
    /// Username.
    pub username: String,
    /// Email address.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Job title.
    pub job_title: Option<String>,
    /// Role.
    pub role: Role,
    /// Department.
    pub department: Department,
    /// Lifecycle state.
    pub status: AccountStatus,
    /// Last login time.
    pub last_login: Option<DateTime<Utc>>,
    /// When created.
    pub created_at: DateTime<Utc>,
    /// When last changed.
    pub updated_at: DateTime<Utc>,
}

/// Input for account creation.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    /// Requested username.
    pub username: String,
    /// Email address.
    pub email: String,
    /// Plaintext password, hashed before storage.
    pub password: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Job title.
    pub job_title: Option<String>,
    /// Role.
    pub role: Role,
    /// Department.
    pub department: Department,
}

/// Self-service profile changes. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    /// New given name.
    pub first_name: Option<String>,
    /// New family name.
    pub last_name: Option<String>,
    /// New job title. An empty string clears it.
    pub job_title: Option<String>,
}

fn name_problems(errors: &mut FieldErrors, field: &str, value: &str) {
    if value.trim().is_empty() {
        errors.add(field, "Must not be empty");
    } else if value.chars().count() > limits::MAX_NAME_LENGTH {
        errors.add(
            field,
            format!("Must be at most {} characters", limits::MAX_NAME_LENGTH),
        );
    }
}

impl ProfileUpdate {
    fn validate(&self) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        if let Some(first) = &self.first_name {
            name_problems(&mut errors, "firstName", first);
        }
        if let Some(last) = &self.last_name {
            name_problems(&mut errors, "lastName", last);
        }
        if let Some(title) = &self.job_title {
            if title.chars().count() > limits::MAX_NAME_LENGTH {
                errors.add("jobTitle", "Too long");
            }
        }
        errors.into_result()
    }
}

/// User store backed by sled.
///
/// Username and email uniqueness is case-insensitive and enforced by
/// claiming index keys with compare-and-swap.
#[derive(Clone)]
pub struct UserStore {
    db: sled::Db,
    users: sled::Tree,
    index: sled::Tree,
}

impl UserStore {
    /// Open the user trees in an existing sled database.
    ///
    /// # Errors
    ///
    /// Returns error if trees cannot be opened.
    pub fn new(db: &sled::Db) -> Result<Self, AuthError> {
        let users = db
            .open_tree(USERS_TREE)
            .map_err(|e| AuthError::Storage(format!("Failed to open users tree: {e}")))?;
        let index = db
            .open_tree(INDEX_TREE)
            .map_err(|e| AuthError::Storage(format!("Failed to open index tree: {e}")))?;

        Ok(Self {
            db: db.clone(),
            users,
            index,
        })
    }

    /// Check if any users exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Count users, including deleted ones.
    #[must_use]
    pub fn count(&self) -> usize {
        self.users.len()
    }

    /// Create a new user.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for bad input, `Conflict` if the username or
    /// email is taken, or `Storage`.
    pub fn create(&self, new: NewUser) -> Result<User, AuthError> {
        let username = validation::normalize_username(&new.username);
        let email = validation::normalize_email(&new.email);

        let mut errors = FieldErrors::new();
        if let Err(e) = validation::validate_account_fields(&username, &email, &new.password) {
            errors.extend(e);
        }
        name_problems(&mut errors, "firstName", &new.first_name);
        name_problems(&mut errors, "lastName", &new.last_name);
        errors.into_result()?;

        let password_hash = hash_password(&new.password)?;
        let id = UserId(self.db.generate_id()? + 1);
        let id_key = id.to_key();

        let username_key = username_index_key(&username);
        if !self.claim(&username_key, &id_key)? {
            return Err(AuthError::Conflict("Username already taken".to_string()));
        }

        let email_key = email_index_key(&email);
        if !self.claim(&email_key, &id_key)? {
            self.release(&username_key, &id_key);
            return Err(AuthError::Conflict("Email already registered".to_string()));
        }

        let now = Utc::now();
        let user = User {
            id,
            username,
            email,
            password_hash,
            first_name: new.first_name.trim().to_string(),
            last_name: new.last_name.trim().to_string(),
            job_title: new
                .job_title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            role: new.role,
            department: new.department,
            status: AccountStatus::Active,
            last_login: None,
            created_at: now,
            updated_at: now,
        };

        let stored = encode(&user).and_then(|bytes| Ok(self.users.insert(id_key, bytes)?));
        if let Err(e) = stored {
            self.release(&username_key, &id_key);
            self.release(&email_key, &id_key);
            return Err(e);
        }
        self.users
            .flush()
            .map_err(|e| AuthError::Storage(format!("Flush error: {e}")))?;

        tracing::info!(user_id = %user.id, username = %user.username, role = %user.role, "User created");
        Ok(user)
    }

    fn claim(&self, key: &[u8], id_key: &[u8; 8]) -> Result<bool, AuthError> {
        Ok(self
            .index
            .compare_and_swap(key, None as Option<&[u8]>, Some(&id_key[..]))?
            .is_ok())
    }

    /// Drop an index claim held by `id_key`. Failures are logged and leave
    /// the claim in place.
    fn release(&self, key: &[u8], id_key: &[u8; 8]) -> bool {
        match self
            .index
            .compare_and_swap(key, Some(&id_key[..]), None as Option<&[u8]>)
        {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                tracing::warn!(key = %String::from_utf8_lossy(key), "Index claim held by another user");
                false
            }
            Err(e) => {
                tracing::error!(key = %String::from_utf8_lossy(key), error = %e, "Failed to release index claim");
                false
            }
        }
    }

    /// Get a user by ID.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn get(&self, id: UserId) -> Result<Option<User>, AuthError> {
        self.users
            .get(id.to_key())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Get a user by username (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn get_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        let username = validation::normalize_username(username);
        self.get_indexed(&username_index_key(&username))
    }

    /// Get a user by email (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn get_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        let email = validation::normalize_email(email);
        self.get_indexed(&email_index_key(&email))
    }

    fn get_indexed(&self, key: &[u8]) -> Result<Option<User>, AuthError> {
        match self.index.get(key)? {
            Some(id_bytes) => {
                let raw: [u8; 8] = id_bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| AuthError::Storage("Corrupt index entry".to_string()))?;
                self.get(UserId(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Check a password for the account named by username or email.
    ///
    /// Records the login time on success.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials` for an unknown identifier or wrong
    /// password, `AccountInactive` for a non-active account.
    pub fn authenticate(&self, identifier: &str, password: &str) -> Result<User, AuthError> {
        let found = if identifier.contains('@') {
            self.get_by_email(identifier)?
        } else {
            self.get_by_username(identifier)?
        };
        let user = found.ok_or(AuthError::InvalidCredentials)?;

        user.verify_password(password)?;

        if !user.is_active() {
            return Err(AuthError::AccountInactive(user.status));
        }

        self.modify(user.id, |u| {
            u.last_login = Some(Utc::now());
            Ok(())
        })
    }

    /// Apply a change to a stored user atomically.
    ///
    /// The closure may run more than once if the record changes concurrently.
    ///
    /// # Errors
    ///
    /// Returns `UserNotFound`, the closure's error, or `Storage`.
    pub fn modify<F>(&self, id: UserId, mut change: F) -> Result<User, AuthError>
    where
        F: FnMut(&mut User) -> Result<(), AuthError>,
    {
        let key = id.to_key();
        loop {
            let current = self
                .users
                .get(key)?
                .ok_or_else(|| AuthError::UserNotFound(id.to_string()))?;

            let mut user = decode(&current)?;
            change(&mut user)?;
            user.updated_at = Utc::now();

            let next = encode(&user)?;
            if self
                .users
                .compare_and_swap(key, Some(current), Some(next))?
                .is_ok()
            {
                self.users
                    .flush()
                    .map_err(|e| AuthError::Storage(format!("Flush error: {e}")))?;
                return Ok(user);
            }
        }
    }

    /// Apply a self-service profile update.
    ///
    /// # Errors
    ///
    /// Returns `Validation`, `UserNotFound`, or `Storage`.
    pub fn update_profile(&self, id: UserId, update: &ProfileUpdate) -> Result<User, AuthError> {
        update.validate()?;
        self.modify(id, |u| {
            if let Some(first) = &update.first_name {
                u.first_name = first.trim().to_string();
            }
            if let Some(last) = &update.last_name {
                u.last_name = last.trim().to_string();
            }
            if let Some(title) = &update.job_title {
                let title = title.trim();
                u.job_title = (!title.is_empty()).then(|| title.to_string());
            }
            Ok(())
        })
    }

    /// Replace a user's password.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a weak password, `UserNotFound`, or `Storage`.
    pub fn set_password(&self, id: UserId, new_password: &str) -> Result<User, AuthError> {
        let problems = validation::password_problems(new_password);
        if !problems.is_empty() {
            let mut errors = FieldErrors::new();
            for p in problems {
                errors.add("newPassword", p);
            }
            return Err(errors.into());
        }

        let hash = hash_password(new_password)?;
        self.modify(id, |u| {
            u.password_hash.clone_from(&hash);
            Ok(())
        })
    }

    /// Replace a user's password after checking the current one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials` if `current` is wrong, plus the errors of
    /// [`UserStore::set_password`].
    pub fn change_password(
        &self,
        id: UserId,
        current: &str,
        new_password: &str,
    ) -> Result<User, AuthError> {
        let user = self
            .get(id)?
            .ok_or_else(|| AuthError::UserNotFound(id.to_string()))?;
        user.verify_password(current)?;
        self.set_password(id, new_password)
    }

    /// Change a user's role.
    ///
    /// # Errors
    ///
    /// Returns `UserNotFound` or `Storage`.
    pub fn set_role(&self, id: UserId, role: Role) -> Result<User, AuthError> {
        self.modify(id, |u| {
            u.role = role;
            Ok(())
        })
    }

    /// Change a user's department.
    ///
    /// # Errors
    ///
    /// Returns `UserNotFound` or `Storage`.
    pub fn set_department(&self, id: UserId, department: Department) -> Result<User, AuthError> {
        self.modify(id, |u| {
            u.department = department;
            Ok(())
        })
    }

    /// Move a user through the account lifecycle.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for a disallowed move, `UserNotFound`, or
    /// `Storage`.
    pub fn transition(&self, id: UserId, to: AccountStatus) -> Result<User, AuthError> {
        let user = self.modify(id, |u| {
            if !u.status.can_transition_to(to) {
                return Err(AuthError::InvalidTransition { from: u.status, to });
            }
            u.status = to;
            Ok(())
        })?;
        tracing::info!(user_id = %id, status = %to, "Account status changed");
        Ok(user)
    }

    /// List users in id order.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn list(&self, include_deleted: bool) -> Result<Vec<User>, AuthError> {
        let mut users = Vec::new();
        for result in self.users.iter() {
            let (_, value) = result?;
            let user = decode(&value)?;
            if include_deleted || user.status != AccountStatus::Deleted {
                users.push(user);
            }
        }
        Ok(users)
    }
}

impl fmt::Debug for UserStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserStore")
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

fn username_index_key(username: &str) -> Vec<u8> {
    format!("username:{}", username.to_lowercase()).into_bytes()
}

fn email_index_key(email: &str) -> Vec<u8> {
    format!("email:{email}").into_bytes()
}

fn encode(user: &User) -> Result<Vec<u8>, AuthError> {
    serde_json::to_vec(user).map_err(|e| AuthError::Storage(format!("Serialization error: {e}")))
}

fn decode(bytes: &[u8]) -> Result<User, AuthError> {
    serde_json::from_slice(bytes)
        .map_err(|e| AuthError::Storage(format!("Deserialization error: {e}")))
}

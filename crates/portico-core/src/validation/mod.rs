//! Input validation and normalization for account data.
//!
//! Validate all external inputs before they reach storage. Identifiers are
//! NFKC-normalized so visually identical usernames collide in the unique
//! index instead of coexisting.

use std::collections::BTreeMap;

use serde::Serialize;
use unicode_normalization::UnicodeNormalization;
use validator::{ValidateEmail, ValidationErrors};

/// Size limits per input type.
pub mod limits {
    /// Minimum username length (characters).
    pub const MIN_USERNAME_LENGTH: usize = 3;

    /// Maximum username length (characters).
    pub const MAX_USERNAME_LENGTH: usize = 50;

    /// Minimum password length (characters).
    pub const MIN_PASSWORD_LENGTH: usize = 6;

    /// Maximum password length (bytes). Bounds hashing cost.
    pub const MAX_PASSWORD_LENGTH: usize = 128;

    /// Maximum length of a display name component.
    pub const MAX_NAME_LENGTH: usize = 100;

    /// Maximum email length.
    pub const MAX_EMAIL_LENGTH: usize = 254;
}

/// Field-level validation messages, keyed by camelCase field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message against a field.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    /// Whether no errors were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Messages recorded for a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    /// Merge another set into this one.
    pub fn extend(&mut self, other: Self) {
        for (field, messages) in other.0 {
            self.0.entry(field).or_default().extend(messages);
        }
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    ///
    /// # Errors
    ///
    /// Returns the collected errors if any were recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl From<ValidationErrors> for FieldErrors {
    fn from(errors: ValidationErrors) -> Self {
        let mut out = Self::new();
        for (field, errs) in errors.field_errors() {
            for err in errs {
                let message = err
                    .message
                    .as_ref()
                    .map_or_else(|| format!("invalid ({})", err.code), ToString::to_string);
                out.add(to_camel_case(field), message);
            }
        }
        out
    }
}

fn to_camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Normalize a username for storage and lookup (NFKC, trimmed).
#[must_use]
pub fn normalize_username(input: &str) -> String {
    input.trim().nfkc().collect()
}

/// Normalize an email for storage and lookup (trimmed, lowercase).
#[must_use]
pub fn normalize_email(input: &str) -> String {
    input.trim().to_lowercase()
}

/// Validate a (normalized) username.
#[must_use]
pub fn username_problems(username: &str) -> Vec<String> {
    let mut problems = Vec::new();
    let len = username.chars().count();
    if !(limits::MIN_USERNAME_LENGTH..=limits::MAX_USERNAME_LENGTH).contains(&len) {
        problems.push(format!(
            "Username must be between {} and {} characters",
            limits::MIN_USERNAME_LENGTH,
            limits::MAX_USERNAME_LENGTH
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        problems.push("Username may only contain letters, digits, '_', '.' and '-'".to_string());
    }
    problems
}

/// Validate a (normalized) email address.
#[must_use]
pub fn email_problems(email: &str) -> Vec<String> {
    if email.len() > limits::MAX_EMAIL_LENGTH || !email.validate_email() {
        vec!["Invalid email format".to_string()]
    } else {
        Vec::new()
    }
}

/// Validate a candidate password against the length policy.
#[must_use]
pub fn password_problems(password: &str) -> Vec<String> {
    let mut problems = Vec::new();
    if password.chars().count() < limits::MIN_PASSWORD_LENGTH {
        problems.push(format!(
            "Password must be at least {} characters",
            limits::MIN_PASSWORD_LENGTH
        ));
    }
    if password.len() > limits::MAX_PASSWORD_LENGTH {
        problems.push(format!(
            "Password must be at most {} bytes",
            limits::MAX_PASSWORD_LENGTH
        ));
    }
    problems
}

/// Validate the full set of registration identifiers at once.
///
/// # Errors
///
/// Returns every field problem found.
pub fn validate_account_fields(
    username: &str,
    email: &str,
    password: &str,
) -> Result<(), FieldErrors> {
    let mut errors = FieldErrors::new();
    for p in username_problems(username) {
        errors.add("username", p);
    }
    for p in email_problems(email) {
        errors.add("email", p);
    }
    for p in password_problems(password) {
        errors.add("password", p);
    }
    errors.into_result()
}

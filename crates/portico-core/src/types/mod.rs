//! Core domain types shared by the gateway, the auth service and the CLI.
//!
//! Roles, departments and permissions are closed enums so that adding a
//! variant forces every `match` over them to be revisited.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing a domain enum from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {kind}: {value}")]
pub struct ParseTypeError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl ParseTypeError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Stable numeric identifier of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    /// Big-endian key bytes, so sled iteration follows id order.
    #[must_use]
    pub const fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| ParseTypeError::new("user id", s))
    }
}

/// User role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Company direction. Satisfies every department and role check.
    Director,
    /// System and user administration.
    Administrator,
    /// Regular staff member.
    #[default]
    Employee,
}

impl Role {
    /// All roles, most privileged first.
    pub const ALL: [Self; 3] = [Self::Director, Self::Administrator, Self::Employee];

    /// Get string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Director => "director",
            Self::Administrator => "administrator",
            Self::Employee => "employee",
        }
    }

    /// Whether this role is the authorization superset.
    #[must_use]
    pub const fn is_director(&self) -> bool {
        matches!(self, Self::Director)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseTypeError::new("role", s))
    }
}

/// Business unit a user belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Department {
    /// Not assigned to any department.
    #[default]
    None,
    /// IT.
    Informatica,
    /// Laboratory.
    Laboratorio,
    /// Administration.
    Administracion,
    /// Accounting.
    Contabilidad,
    /// Human resources.
    RecursosHumanos,
    /// Purchasing.
    Compras,
    /// Sales.
    Ventas,
    /// Production.
    Produccion,
    /// Quality assurance.
    Calidad,
    /// Logistics.
    Logistica,
    /// Maintenance.
    Mantenimiento,
    /// Warehouse.
    Almacen,
    /// Legal.
    Juridico,
    /// General management.
    DireccionGeneral,
}

impl Department {
    /// Every department, including [`Department::None`].
    pub const ALL: [Self; 15] = [
        Self::None,
        Self::Informatica,
        Self::Laboratorio,
        Self::Administracion,
        Self::Contabilidad,
        Self::RecursosHumanos,
        Self::Compras,
        Self::Ventas,
        Self::Produccion,
        Self::Calidad,
        Self::Logistica,
        Self::Mantenimiento,
        Self::Almacen,
        Self::Juridico,
        Self::DireccionGeneral,
    ];

    /// Get string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Informatica => "informatica",
            Self::Laboratorio => "laboratorio",
            Self::Administracion => "administracion",
            Self::Contabilidad => "contabilidad",
            Self::RecursosHumanos => "recursos_humanos",
            Self::Compras => "compras",
            Self::Ventas => "ventas",
            Self::Produccion => "produccion",
            Self::Calidad => "calidad",
            Self::Logistica => "logistica",
            Self::Mantenimiento => "mantenimiento",
            Self::Almacen => "almacen",
            Self::Juridico => "juridico",
            Self::DireccionGeneral => "direccion_general",
        }
    }
}

impl fmt::Display for Department {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Department {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseTypeError::new("department", s))
    }
}

/// Named capability granted to roles by a static table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Create, list and modify user accounts.
    ManageUsers,
    /// Read cross-department reports.
    ViewReports,
    /// Operate system-level configuration.
    ManageSystem,
    /// Reassign users between departments.
    ManageDepartments,
    /// Read the company directory.
    ViewDirectory,
}

impl Permission {
    /// Every permission.
    pub const ALL: [Self; 5] = [
        Self::ManageUsers,
        Self::ViewReports,
        Self::ManageSystem,
        Self::ManageDepartments,
        Self::ViewDirectory,
    ];

    /// Get string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ManageUsers => "manage_users",
            Self::ViewReports => "view_reports",
            Self::ManageSystem => "manage_system",
            Self::ManageDepartments => "manage_departments",
            Self::ViewDirectory => "view_directory",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseTypeError::new("permission", s))
    }
}

/// Access condition a route may declare beyond plain authentication.
///
/// Serialized externally tagged, e.g. `{ "department": "laboratorio" }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// Caller must hold exactly this role.
    Role(Role),
    /// Caller must belong to this department.
    Department(Department),
    /// Caller's role must grant this permission.
    Permission(Permission),
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role(r) => write!(f, "role:{r}"),
            Self::Department(d) => write!(f, "department:{d}"),
            Self::Permission(p) => write!(f, "permission:{p}"),
        }
    }
}

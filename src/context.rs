use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Principal,
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Principal => "principal",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "principal" => Ok(Role::Principal),
            "teacher" => Ok(Role::Teacher),
            "student" => Ok(Role::Student),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// Who is looking at the data. Passed into every filter call instead of
/// being read from session storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleContext {
    pub role: Role,
    pub teacher_name: Option<String>,
    pub student_id: Option<String>,
}

impl RoleContext {
    pub fn admin() -> Self {
        Self {
            role: Role::Admin,
            teacher_name: None,
            student_id: None,
        }
    }

    pub fn principal() -> Self {
        Self {
            role: Role::Principal,
            ..Self::admin()
        }
    }

    pub fn teacher(name: impl Into<String>) -> Self {
        Self {
            role: Role::Teacher,
            teacher_name: Some(name.into()),
            student_id: None,
        }
    }

    pub fn student(student_id: impl Into<String>) -> Self {
        Self {
            role: Role::Student,
            teacher_name: None,
            student_id: Some(student_id.into()),
        }
    }
}

impl Default for RoleContext {
    fn default() -> Self {
        Self::admin()
    }
}

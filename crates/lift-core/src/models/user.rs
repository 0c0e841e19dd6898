use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Technician,
    #[serde(other)]
    Unknown,
}

impl Role {
    /// Whether this role may download the user directory and sim cards.
    pub fn is_privileged(self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

/// Cached profile of the signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_roles_are_not_privileged() {
        let profile: UserProfile =
            serde_json::from_value(json!({"_id": "u1", "role": "guest"})).unwrap();
        assert_eq!(profile.role, Role::Unknown);
        assert!(!profile.role.is_privileged());
        assert!(Role::Admin.is_privileged());
    }
}

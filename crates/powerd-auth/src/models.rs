use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resource/action grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
}

impl Permission {
    pub fn new(resource: &str, action: &str) -> Self {
        Self {
            resource: resource.to_string(),
            action: action.to_string(),
        }
    }

    pub fn matches(&self, resource: &str, action: &str) -> bool {
        (self.resource == resource || self.resource == "*")
            && (self.action == action || self.action == "*")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub roles: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Built-in role set: `admin` holds every engine permission, `operator`
/// drives deployments and services, `viewer` is read-only.
pub fn builtin_roles() -> Vec<Role> {
    vec![
        Role {
            name: "admin".to_string(),
            permissions: vec![Permission::new("*", "*")],
        },
        Role {
            name: "operator".to_string(),
            permissions: vec![
                Permission::new("deployment", "create"),
                Permission::new("deployment", "execute"),
                Permission::new("deployment", "view"),
                Permission::new("service", "manage"),
                Permission::new("server", "manage"),
            ],
        },
        Role {
            name: "viewer".to_string(),
            permissions: vec![Permission::new("deployment", "view")],
        },
    ]
}

use crate::jwt::{Claims, TokenIssuer};
use crate::models::{builtin_roles, Permission, Role, User};
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use chrono::Utc;
use powerd_core::config::AuthConfig;
use powerd_core::{AuthOutcome, Error, IdentityProvider, Result, UserSummary};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-process identity provider backing the engine permission gates and the
/// API's login endpoint.
pub struct AuthService {
    users_by_name: RwLock<HashMap<String, User>>,
    users_by_id: RwLock<HashMap<Uuid, User>>,
    roles: HashMap<String, Role>,
    issuer: TokenIssuer,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Self {
        let roles = builtin_roles()
            .into_iter()
            .map(|role| (role.name.clone(), role))
            .collect();
        Self {
            users_by_name: RwLock::new(HashMap::new()),
            users_by_id: RwLock::new(HashMap::new()),
            roles,
            issuer: TokenIssuer::new(
                &config.jwt_secret,
                config.access_token_lifetime_seconds,
                config.refresh_token_lifetime_seconds,
            ),
        }
    }

    /// Register a user with the given roles. Intended for bootstrap and the
    /// admin plane; not exposed through the engine API.
    pub async fn register_user(
        &self,
        username: &str,
        password: &str,
        roles: Vec<String>,
    ) -> Result<User> {
        for role in &roles {
            if !self.roles.contains_key(role) {
                return Err(Error::invalid_configuration(format!("unknown role {role}")));
            }
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::internal(format!("password hashing failed: {e}")))?
            .to_string();

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash,
            roles,
            active: true,
            created_at: Utc::now(),
        };

        self.users_by_name
            .write()
            .await
            .insert(username.to_string(), user.clone());
        self.users_by_id.write().await.insert(user.id, user.clone());

        tracing::info!("registered user {username}");
        Ok(user)
    }

    /// Validate a bearer token and return its claims.
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        self.issuer.verify(token)
    }

    fn permissions_for(&self, role_names: &[String]) -> Vec<Permission> {
        role_names
            .iter()
            .filter_map(|name| self.roles.get(name))
            .flat_map(|role| role.permissions.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl IdentityProvider for AuthService {
    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthOutcome> {
        let user = {
            let users = self.users_by_name.read().await;
            users.get(username).cloned()
        };

        let user = match user {
            Some(user) if user.active => user,
            Some(_) => return Ok(AuthOutcome::failure("account inactive")),
            None => return Ok(AuthOutcome::failure("invalid credentials")),
        };

        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|e| Error::internal(format!("stored hash invalid: {e}")))?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_err()
        {
            return Ok(AuthOutcome::failure("invalid credentials"));
        }

        let tokens = self
            .issuer
            .issue_pair(user.id, &user.username, &user.roles)?;

        Ok(AuthOutcome {
            success: true,
            user: Some(UserSummary {
                id: user.id,
                username: user.username,
                roles: user.roles,
            }),
            error: None,
            tokens: Some(tokens),
        })
    }

    async fn has_permission(&self, user_id: Uuid, resource: &str, action: &str) -> Result<bool> {
        let user = {
            let users = self.users_by_id.read().await;
            users.get(&user_id).cloned()
        };
        let Some(user) = user else {
            return Ok(false);
        };
        if !user.active {
            return Ok(false);
        }

        Ok(self
            .permissions_for(&user.roles)
            .iter()
            .any(|p| p.matches(resource, action)))
    }

    async fn get_user_roles(&self, user_id: Uuid) -> Result<Vec<String>> {
        let users = self.users_by_id.read().await;
        users
            .get(&user_id)
            .map(|user| user.roles.clone())
            .ok_or_else(|| Error::not_found(format!("user {user_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new(&AuthConfig::default())
    }

    #[tokio::test]
    async fn authenticate_issues_tokens_for_valid_credentials() {
        let auth = service();
        auth.register_user("op", "hunter2-but-long", vec!["operator".to_string()])
            .await
            .unwrap();

        let outcome = auth.authenticate("op", "hunter2-but-long").await.unwrap();
        assert!(outcome.success);
        let tokens = outcome.tokens.unwrap();
        let claims = auth.verify_token(&tokens.access_token).unwrap();
        assert_eq!(claims.username, "op");
    }

    #[tokio::test]
    async fn bad_password_fails_without_error() {
        let auth = service();
        auth.register_user("op", "correct-password", vec!["operator".to_string()])
            .await
            .unwrap();

        let outcome = auth.authenticate("op", "wrong").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.tokens.is_none());
    }

    #[tokio::test]
    async fn operator_can_deploy_but_not_manage_system() {
        let auth = service();
        let user = auth
            .register_user("op", "some-password", vec!["operator".to_string()])
            .await
            .unwrap();

        assert!(auth
            .has_permission(user.id, "deployment", "execute")
            .await
            .unwrap());
        assert!(!auth
            .has_permission(user.id, "system", "manage")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn admin_wildcard_covers_all_resources() {
        let auth = service();
        let user = auth
            .register_user("root", "some-password", vec!["admin".to_string()])
            .await
            .unwrap();
        assert!(auth
            .has_permission(user.id, "system", "manage")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unknown_role_is_rejected() {
        let auth = service();
        let outcome = auth
            .register_user("x", "pw-long-enough", vec!["superuser".to_string()])
            .await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn roles_lookup_for_unknown_user_is_not_found() {
        let auth = service();
        assert!(auth.get_user_roles(Uuid::new_v4()).await.is_err());
    }
}

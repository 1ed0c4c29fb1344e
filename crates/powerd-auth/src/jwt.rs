//! JWT issuance and validation.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use powerd_core::{Error, Result, TokenPair};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub username: String,
    pub roles: Vec<String>,
    pub token_type: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_lifetime_seconds: u64,
    refresh_lifetime_seconds: u64,
}

impl TokenIssuer {
    pub fn new(secret: &str, access_lifetime_seconds: u64, refresh_lifetime_seconds: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_lifetime_seconds,
            refresh_lifetime_seconds,
        }
    }

    pub fn issue_pair(&self, user_id: Uuid, username: &str, roles: &[String]) -> Result<TokenPair> {
        let access = self.issue(user_id, username, roles, "access", self.access_lifetime_seconds)?;
        let refresh = self.issue(
            user_id,
            username,
            roles,
            "refresh",
            self.refresh_lifetime_seconds,
        )?;
        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
            expires_in_seconds: self.access_lifetime_seconds,
        })
    }

    fn issue(
        &self,
        user_id: Uuid,
        username: &str,
        roles: &[String],
        token_type: &str,
        lifetime_seconds: u64,
    ) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            roles: roles.to_vec(),
            token_type: token_type.to_string(),
            iat: now,
            exp: now + lifetime_seconds as i64,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| Error::internal(format!("token encoding failed: {e}")))
    }

    /// Validate an access token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| Error::permission_denied(format!("invalid token: {e}")))?;
        if data.claims.token_type != "access" {
            return Err(Error::permission_denied("refresh token used as access token"));
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new("test-secret-at-least-32-characters", 3600, 604_800)
    }

    #[test]
    fn issued_access_token_verifies() {
        let issuer = issuer();
        let user_id = Uuid::new_v4();
        let pair = issuer
            .issue_pair(user_id, "op", &["operator".to_string()])
            .unwrap();
        let claims = issuer.verify(&pair.access_token).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.roles, vec!["operator"]);
    }

    #[test]
    fn refresh_token_is_rejected_as_access() {
        let issuer = issuer();
        let pair = issuer
            .issue_pair(Uuid::new_v4(), "op", &["operator".to_string()])
            .unwrap();
        assert!(issuer.verify(&pair.refresh_token).is_err());
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(issuer().verify("not-a-token").is_err());
    }
}

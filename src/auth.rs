//! Identity resolution is an external concern; the server only needs
//! `bearer -> userId`. `StaticTokenAuth` is the built-in implementation,
//! suitable for single-box deployments and tests.

use async_trait::async_trait;
use subtle::ConstantTimeEq;

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Resolve a bearer token to a user id, or `None` if unauthorized.
    async fn resolve_user(&self, bearer: &str) -> Option<String>;
}

/// Fixed token→user mapping from `MAISON_AUTH_TOKENS`
/// ("token1=alice,token2=bob").
pub struct StaticTokenAuth {
    tokens: Vec<(String, String)>,
}

impl StaticTokenAuth {
    pub fn new(tokens: Vec<(String, String)>) -> Self {
        Self { tokens }
    }

    pub fn from_env() -> Self {
        let raw = std::env::var("MAISON_AUTH_TOKENS").unwrap_or_default();
        let tokens = raw
            .split(',')
            .filter_map(|pair| {
                let (token, user) = pair.split_once('=')?;
                let (token, user) = (token.trim(), user.trim());
                (!token.is_empty() && !user.is_empty())
                    .then(|| (token.to_string(), user.to_string()))
            })
            .collect();
        Self { tokens }
    }
}

#[async_trait]
impl AuthService for StaticTokenAuth {
    async fn resolve_user(&self, bearer: &str) -> Option<String> {
        // constant-time comparison to prevent timing attacks
        self.tokens
            .iter()
            .find(|(token, _)| bool::from(bearer.as_bytes().ct_eq(token.as_bytes())))
            .map(|(_, user)| user.clone())
    }
}

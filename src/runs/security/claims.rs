use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserClaims {
    pub sub: String, // Subject
    pub name: Option<String>,
    pub roles: Option<Vec<String>>,
    pub exp: usize, // UNIX timestamp
}

/// Raw bearer token of the request, forwarded to the agent service as the
/// run's credential.
#[derive(Clone)]
pub struct BearerCredential(pub String);

impl std::fmt::Debug for BearerCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerCredential(<redacted>)")
    }
}

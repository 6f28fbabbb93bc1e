//! Authentication Models
//! Mission: Define the identity and claim shapes the live service trusts

use serde::{Deserialize, Serialize};

/// A validated identity behind a live connection.
///
/// This is all the service ever learns about a user; account storage and
/// registration live in the platform backend, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// JWT Claims payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // subject (user_id)
    pub username: String,
    pub exp: usize, // expiration timestamp
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Identity {
            user_id: claims.sub,
            username: claims.username,
        }
    }
}

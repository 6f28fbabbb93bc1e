//! Authentication Module
//! Mission: Gate live connections behind platform-issued JWT tokens

pub mod jwt;
pub mod models;

pub use jwt::{Authenticator, JwtHandler};
pub use models::{Claims, Identity};

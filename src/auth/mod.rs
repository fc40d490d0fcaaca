// src/auth/mod.rs

pub mod jwt;
pub mod keys;
pub mod middleware;

pub use jwt::{Claims, JwtService};
pub use keys::{generate_api_key, hash_api_key, lookup_digest, mint_caller_id, verify_api_key, ApiKeyCipher};
pub use middleware::AuthContext;

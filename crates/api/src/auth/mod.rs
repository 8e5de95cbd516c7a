//! Authentication module for Boilerkit

#[cfg(test)]
mod edge_case_tests;
pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;
pub mod password;
pub mod sessions;
pub mod tokens;

pub use jwt::{Claims, IssuedToken, JwtError, JwtManager};
pub use middleware::{
    ban_is_active, clear_session_cookie, extract_ip_address, extract_user_agent, require_auth,
    session_cookie, AuthError, AuthState, AuthUser, SESSION_COOKIE,
};
pub use password::{
    generate_impossible_hash, hash_password, validate_password_strength, verify_password,
};
pub use tokens::TokenPurpose;

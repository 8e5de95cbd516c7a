//! Edge Case Tests for Authentication System
//!
//! Tests critical boundary conditions in:
//! - JWT token handling (AUTH-J01 to AUTH-J06)
//! - Password policy (AUTH-P01 to AUTH-P05)
//! - Verification tokens (AUTH-V01 to AUTH-V04)

#[cfg(test)]
mod jwt_tests {
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use super::super::jwt::*;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    fn manager() -> JwtManager {
        JwtManager::new(SECRET, 24)
    }

    // =========================================================================
    // AUTH-J01: Token expired an hour ago - rejected as expired
    // =========================================================================
    #[test]
    fn test_expired_token_rejected() {
        let issued_at = OffsetDateTime::now_utc() - Duration::hours(25);
        let issued = manager()
            .generate_token_at(Uuid::new_v4(), "a@example.com", "user", issued_at)
            .unwrap();
        assert_eq!(manager().validate_token(&issued.token), Err(JwtError::Expired));
    }

    // =========================================================================
    // AUTH-J02: Token expired 30s ago - accepted within clock-skew leeway
    // =========================================================================
    #[test]
    fn test_expiry_within_leeway_accepted() {
        let issued_at = OffsetDateTime::now_utc() - Duration::hours(24) - Duration::seconds(30);
        let issued = manager()
            .generate_token_at(Uuid::new_v4(), "a@example.com", "user", issued_at)
            .unwrap();
        assert!(manager().validate_token(&issued.token).is_ok());
    }

    // =========================================================================
    // AUTH-J03: Payload edited after signing - signature check fails
    // =========================================================================
    #[test]
    fn test_tampered_payload_rejected() {
        let issued = manager()
            .generate_token(Uuid::new_v4(), "a@example.com", "user")
            .unwrap();
        let parts: Vec<&str> = issued.token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let other = manager()
            .generate_token(Uuid::new_v4(), "a@example.com", "admin")
            .unwrap();
        let other_payload = other.token.split('.').nth(1).unwrap();

        let spliced = format!("{}.{}.{}", parts[0], other_payload, parts[2]);
        assert_eq!(manager().validate_token(&spliced), Err(JwtError::Invalid));
    }

    // =========================================================================
    // AUTH-J04: Same secret, different algorithm - rejected
    // =========================================================================
    #[test]
    fn test_other_algorithm_rejected() {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            role: "user".to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.unix_timestamp(),
            exp: (now + Duration::hours(1)).unix_timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(manager().validate_token(&token), Err(JwtError::Invalid));
    }

    // =========================================================================
    // AUTH-J05: Garbage and empty strings - rejected, never panic
    // =========================================================================
    #[test]
    fn test_garbage_tokens_rejected() {
        for token in ["", "abc", "a.b.c", "....", "Bearer x"] {
            assert_eq!(manager().validate_token(token), Err(JwtError::Invalid), "{token:?}");
        }
    }

    // =========================================================================
    // AUTH-J06: Expiry follows the configured lifetime
    // =========================================================================
    #[test]
    fn test_expiry_matches_configuration() {
        let manager = JwtManager::new(SECRET, 168);
        let issued_at = OffsetDateTime::now_utc();
        let issued = manager
            .generate_token_at(Uuid::new_v4(), "a@example.com", "user", issued_at)
            .unwrap();
        assert_eq!(issued.expires_at - issued_at, Duration::days(7));
        assert_eq!(manager.expiry(), Duration::hours(168));
    }
}

#[cfg(test)]
mod password_tests {
    use super::super::password::*;

    // =========================================================================
    // AUTH-P01: Exactly 8 characters - accepted
    // =========================================================================
    #[test]
    fn test_minimum_length_accepted() {
        assert!(validate_password_strength("12345678").is_ok());
    }

    // =========================================================================
    // AUTH-P02: 7 characters - rejected
    // =========================================================================
    #[test]
    fn test_below_minimum_rejected() {
        let err = validate_password_strength("1234567").unwrap_err();
        assert!(err.contains("at least 8"));
    }

    // =========================================================================
    // AUTH-P03: 128 accepted, 129 rejected
    // =========================================================================
    #[test]
    fn test_maximum_length_boundary() {
        assert!(validate_password_strength(&"a".repeat(MAX_PASSWORD_LENGTH)).is_ok());
        let err = validate_password_strength(&"a".repeat(MAX_PASSWORD_LENGTH + 1)).unwrap_err();
        assert!(err.contains("at most 128"));
    }

    // =========================================================================
    // AUTH-P04: Length counts characters, not bytes
    // =========================================================================
    #[test]
    fn test_multibyte_length_counts_characters() {
        // 8 characters, 16 bytes
        assert!(validate_password_strength("éééééééé").is_ok());
        // 4 characters, 16 bytes
        assert!(validate_password_strength("🔒🔒🔒🔒").is_err());
    }

    // =========================================================================
    // AUTH-P05: Impossible hash matches nothing a user could type
    // =========================================================================
    #[test]
    fn test_impossible_hash_never_verifies() {
        let hash = generate_impossible_hash().unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!verify_password("", &hash));
        assert!(!verify_password("password123", &hash));
    }
}

#[cfg(test)]
mod verification_token_tests {
    use uuid::Uuid;

    use super::super::tokens::*;

    // =========================================================================
    // AUTH-V01: Each purpose has its own identifier namespace
    // =========================================================================
    #[test]
    fn test_purposes_do_not_collide() {
        let user_id = Uuid::new_v4();
        let ids = [
            TokenPurpose::EmailVerification.identifier(user_id),
            TokenPurpose::PasswordReset.identifier(user_id),
            TokenPurpose::DeleteAccount.identifier(user_id),
        ];
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], ids[2]);
    }

    // =========================================================================
    // AUTH-V02: Identifier with trailing data - not parsed
    // =========================================================================
    #[test]
    fn test_identifier_with_trailing_data_rejected() {
        let user_id = Uuid::new_v4();
        let identifier = format!("{}:extra", TokenPurpose::EmailVerification.identifier(user_id));
        assert_eq!(TokenPurpose::EmailVerification.parse_identifier(&identifier), None);
    }

    // =========================================================================
    // AUTH-V03: Purpose prefix without separator - not parsed
    // =========================================================================
    #[test]
    fn test_identifier_needs_separator() {
        let user_id = Uuid::new_v4();
        let identifier = format!("email-verification{user_id}");
        assert_eq!(TokenPurpose::EmailVerification.parse_identifier(&identifier), None);
    }

    // =========================================================================
    // AUTH-V04: Token lifetime is 24 hours
    // =========================================================================
    #[test]
    fn test_token_lifetime() {
        assert_eq!(TOKEN_TTL, time::Duration::hours(24));
        assert_ne!(hash_token(&generate_token()), hash_token(&generate_token()));
    }
}

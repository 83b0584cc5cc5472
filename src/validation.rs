//! Login and password rules shared by the server's account store and clients.

use thiserror::Error;

pub const LOGIN_MIN_LEN: usize = 2;
pub const LOGIN_MAX_LEN: usize = 30;
pub const PASSWORD_MIN_LEN: usize = 6;
pub const PASSWORD_MAX_LEN: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Login must be {min} to {max} characters long")]
    LoginLength { min: usize, max: usize },

    #[error("Login may only contain lowercase letters, digits and periods")]
    LoginCharacters,

    #[error("Login cannot start or end with a period or contain consecutive periods")]
    LoginPeriods,

    #[error("Password must be {min} to {max} characters long")]
    PasswordLength { min: usize, max: usize },
}

/// Validate a login, returning it trimmed
pub fn validate_login(login: &str) -> Result<&str, ValidationError> {
    let login = login.trim();

    let len = login.chars().count();
    if !(LOGIN_MIN_LEN..=LOGIN_MAX_LEN).contains(&len) {
        return Err(ValidationError::LoginLength {
            min: LOGIN_MIN_LEN,
            max: LOGIN_MAX_LEN,
        });
    }

    if !login
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.')
    {
        return Err(ValidationError::LoginCharacters);
    }

    if login.starts_with('.') || login.ends_with('.') || login.contains("..") {
        return Err(ValidationError::LoginPeriods);
    }

    Ok(login)
}

/// Validate a password, returning it trimmed
pub fn validate_password(password: &str) -> Result<&str, ValidationError> {
    let password = password.trim();
    let len = password.chars().count();
    if !(PASSWORD_MIN_LEN..=PASSWORD_MAX_LEN).contains(&len) {
        return Err(ValidationError::PasswordLength {
            min: PASSWORD_MIN_LEN,
            max: PASSWORD_MAX_LEN,
        });
    }
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_length() {
        assert!(matches!(
            validate_login("a"),
            Err(ValidationError::LoginLength { .. })
        ));
        assert!(validate_login("ab").is_ok());
        assert!(validate_login(&"a".repeat(30)).is_ok());
        assert!(validate_login(&"a".repeat(31)).is_err());
        // Trimmed before measuring
        assert!(validate_login("  a  ").is_err());
        assert_eq!(validate_login("  bob  ").unwrap(), "bob");
    }

    #[test]
    fn test_login_characters() {
        assert!(validate_login("a.0").is_ok());
        assert!(validate_login("john.doe99").is_ok());
        assert_eq!(validate_login("John"), Err(ValidationError::LoginCharacters));
        assert_eq!(validate_login("jo hn"), Err(ValidationError::LoginCharacters));
        assert_eq!(validate_login("jo_hn"), Err(ValidationError::LoginCharacters));
    }

    #[test]
    fn test_login_periods() {
        assert_eq!(validate_login("a..a"), Err(ValidationError::LoginPeriods));
        assert_eq!(validate_login(".ab"), Err(ValidationError::LoginPeriods));
        assert_eq!(validate_login("ab."), Err(ValidationError::LoginPeriods));
    }

    #[test]
    fn test_password_length() {
        assert!(validate_password("12345").is_err());
        assert!(validate_password("123456").is_ok());
        assert!(validate_password(&"p".repeat(100)).is_ok());
        assert!(validate_password(&"p".repeat(101)).is_err());
        assert!(validate_password("  12345  ").is_err());
    }
}

//! User agent strings advertised in version messages.

use std::fmt;

/// Errors that can occur during user agent validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAgentError {
    /// The user agent format is invalid (must be `/name:version/`).
    InvalidFormat,
    /// The name component is missing or empty.
    MissingName,
    /// The version component is missing or empty.
    MissingVersion,
}

impl fmt::Display for UserAgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserAgentError::InvalidFormat => {
                write!(f, "User agent must follow format '/name:version/'")
            }
            UserAgentError::MissingName => {
                write!(f, "User agent name component cannot be empty")
            }
            UserAgentError::MissingVersion => {
                write!(f, "User agent version component cannot be empty")
            }
        }
    }
}

impl std::error::Error for UserAgentError {}

/// A validated Bitcoin Core-style user agent: `/name:version/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgent(String);

impl UserAgent {
    /// Validates and wraps a user agent string.
    ///
    /// # Example
    ///
    /// ```
    /// use bitcoin_seeder_connection::UserAgent;
    ///
    /// assert!(UserAgent::new("/bitcoin-seeder:0.1.0/").is_ok());
    /// assert!(UserAgent::new("bitcoin-seeder:0.1.0").is_err());
    /// ```
    pub fn new<S: Into<String>>(user_agent: S) -> Result<Self, UserAgentError> {
        let user_agent = user_agent.into();
        let contents = user_agent
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
            .ok_or(UserAgentError::InvalidFormat)?;
        let (name, version) = contents
            .split_once(':')
            .ok_or(UserAgentError::InvalidFormat)?;

        if version.contains(':') {
            return Err(UserAgentError::InvalidFormat);
        }
        if name.is_empty() {
            return Err(UserAgentError::MissingName);
        }
        if version.is_empty() {
            return Err(UserAgentError::MissingVersion);
        }

        Ok(UserAgent(user_agent))
    }

    /// Builds a user agent from its components without validation.
    pub fn from_name_version(name: &str, version: &str) -> Self {
        UserAgent(format!("/{name}:{version}/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UserAgent {
    fn default() -> Self {
        UserAgent::from_name_version("bitcoin-seeder", env!("CARGO_PKG_VERSION"))
    }
}

impl fmt::Display for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

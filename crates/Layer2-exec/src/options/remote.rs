//! SSH remote options

use crate::executor::{ResolveExecutor, SshDialer, SshExecutor};
use overseer_foundation::{Error, ErrorCollector, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// A host reachable over SSH
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Remote {
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Private key file; exclusive with `password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Jump host used to reach `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Box<Remote>>,

    /// Transport used to open connections
    #[serde(skip)]
    pub dialer: Option<Arc<dyn SshDialer>>,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("port", &self.port)
            .field("key_file", &self.key_file)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("proxy", &self.proxy)
            .field("dialer", &self.dialer.is_some())
            .finish()
    }
}

impl Remote {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = Some(path.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_proxy(mut self, proxy: Remote) -> Self {
        self.proxy = Some(Box::new(proxy));
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn SshDialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// `user@host:port`, or `host:port` without a user
    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            format!("{}:{}", self.host, self.port)
        } else {
            format!("{}@{}:{}", self.user, self.host, self.port)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = ErrorCollector::new();
        errors.when(self.host.trim().is_empty(), "remote host must be specified");
        errors.when(self.port == 0, "remote port must be positive");
        errors.when(
            self.key_file.is_some() && self.password.is_some(),
            "cannot use both a key file and a password",
        );
        if let Some(proxy) = &self.proxy {
            if let Err(e) = proxy.validate() {
                errors.add(match e {
                    Error::Validation(messages) => Error::Validation(
                        messages.into_iter().map(|m| format!("proxy: {}", m)).collect(),
                    ),
                    other => other,
                });
            }
        }
        errors.into_result()
    }

    /// Resolver that dials this remote for every executor it creates
    pub fn resolver(&self) -> Result<ResolveExecutor> {
        let dialer = self
            .dialer
            .clone()
            .ok_or_else(|| {
                Error::invalid(format!("no ssh dialer configured for {}", self.destination()))
            })?;
        Ok(SshExecutor::resolver(self.clone(), dialer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination() {
        assert_eq!(Remote::new("example.com").destination(), "example.com:22");
        assert_eq!(
            Remote::new("example.com").with_user("deploy").with_port(2222).destination(),
            "deploy@example.com:2222"
        );
    }

    #[test]
    fn test_validate() {
        assert!(Remote::new("host").validate().is_ok());
        assert!(Remote::new("").validate().is_err());

        let both = Remote::new("host").with_key_file("/id_rsa").with_password("pw");
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_validate_checks_proxy() {
        let remote = Remote::new("inner").with_proxy(Remote::new(""));
        match remote.validate() {
            Err(Error::Validation(messages)) => {
                assert!(messages.iter().any(|m| m.starts_with("proxy:")));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_resolver_requires_dialer() {
        assert!(Remote::new("host").resolver().is_err());
    }

    #[test]
    fn test_deserialize_defaults_port() {
        let remote: Remote = serde_json::from_str(r#"{"host": "h", "user": "u"}"#).unwrap();
        assert_eq!(remote.port, 22);
        assert!(remote.dialer.is_none());
    }

    #[test]
    fn test_debug_redacts_password() {
        let text = format!("{:?}", Remote::new("h").with_password("hunter2"));
        assert!(!text.contains("hunter2"));
    }
}

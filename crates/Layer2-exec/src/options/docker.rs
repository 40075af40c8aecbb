//! Docker backend options

use crate::executor::{DockerExecutor, Executor, ResolveExecutor};
use bollard::{ClientVersion, Docker as DockerClient, API_DEFAULT_VERSION};
use futures::FutureExt;
use overseer_foundation::{Context, Error, ErrorCollector, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Platforms a container may target
pub const PLATFORMS: [&str; 3] = ["linux", "windows", "darwin"];

/// Seconds before a daemon request times out
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Where and how to run a process in a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Docker {
    /// Daemon host; empty means the local daemon defaults
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// API version as `major.minor`; empty negotiates the default
    #[serde(default)]
    pub api_version: String,
    pub image: String,
    /// Container platform; empty means the supervisor's own OS
    #[serde(default)]
    pub platform: String,
}

/// Platform name for the OS this supervisor runs on
fn default_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "windows",
        _ => "linux",
    }
}

impl Docker {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Check the options, defaulting the platform
    pub fn validate(&mut self) -> Result<()> {
        let mut errors = ErrorCollector::new();
        if self.platform.is_empty() {
            self.platform = default_platform().to_string();
        }

        errors.when(self.image.trim().is_empty(), "docker image must be specified");
        errors.when(
            !PLATFORMS.contains(&self.platform.as_str()),
            format!(
                "unrecognized docker platform '{}' (expected one of {})",
                self.platform,
                PLATFORMS.join(", ")
            ),
        );
        errors.when(
            !self.host.is_empty() && self.port == 0,
            "docker port must be set when a host is given",
        );
        if !self.api_version.is_empty() {
            errors.add_result(parse_api_version(&self.api_version));
        }
        errors.into_result()
    }

    /// Connect to the configured daemon
    pub fn client(&self) -> Result<DockerClient> {
        let parsed;
        let version = if self.api_version.is_empty() {
            API_DEFAULT_VERSION
        } else {
            parsed = parse_api_version(&self.api_version)?;
            &parsed
        };

        let client = if self.host.is_empty() {
            DockerClient::connect_with_local_defaults()
        } else {
            let addr = format!("http://{}:{}", self.host, self.port);
            DockerClient::connect_with_http(&addr, CLIENT_TIMEOUT_SECS, version)
        };
        client.map_err(|e| Error::transport("connecting to docker daemon", e))
    }

    /// Resolver that runs processes in containers of this image
    pub fn resolver(&self) -> Result<ResolveExecutor> {
        let client = self.client()?;
        let image = self.image.clone();
        let platform = self.platform.clone();
        Ok(Arc::new(move |ctx: Context, args: Vec<String>| {
            let executor =
                DockerExecutor::new(ctx, client.clone(), platform.clone(), image.clone(), args);
            async move { Ok(Arc::new(executor) as Arc<dyn Executor>) }.boxed()
        }))
    }
}

fn parse_api_version(version: &str) -> Result<ClientVersion> {
    let invalid = || Error::invalid(format!("invalid docker api version '{}'", version));
    let (major, minor) = version.trim_start_matches('v').split_once('.').ok_or_else(invalid)?;
    Ok(ClientVersion {
        major_version: major.parse().map_err(|_| invalid())?,
        minor_version: minor.parse().map_err(|_| invalid())?,
    })
}

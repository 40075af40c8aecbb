//! Portable signal values
//!
//! Each backend translates a [`Signal`] into its own native form: an OS
//! signal for local processes, a `SIG`-prefixed name for the Docker daemon, a
//! bare name for SSH signal requests, and a `kill -NAME` command for the
//! tunnel backend.

use overseer_foundation::Error;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Abrt,
    Kill,
    Usr1,
    Usr2,
    Pipe,
    Alrm,
    Term,
}

/// name, short name, linux number
const SIGNAL_TABLE: &[(Signal, &str, &str, i32)] = &[
    (Signal::Hup, "SIGHUP", "HUP", 1),
    (Signal::Int, "SIGINT", "INT", 2),
    (Signal::Quit, "SIGQUIT", "QUIT", 3),
    (Signal::Abrt, "SIGABRT", "ABRT", 6),
    (Signal::Kill, "SIGKILL", "KILL", 9),
    (Signal::Usr1, "SIGUSR1", "USR1", 10),
    (Signal::Usr2, "SIGUSR2", "USR2", 12),
    (Signal::Pipe, "SIGPIPE", "PIPE", 13),
    (Signal::Alrm, "SIGALRM", "ALRM", 14),
    (Signal::Term, "SIGTERM", "TERM", 15),
];

impl Signal {
    pub const ALL: [Signal; 10] = [
        Signal::Hup,
        Signal::Int,
        Signal::Quit,
        Signal::Abrt,
        Signal::Kill,
        Signal::Usr1,
        Signal::Usr2,
        Signal::Pipe,
        Signal::Alrm,
        Signal::Term,
    ];

    fn entry(self) -> &'static (Signal, &'static str, &'static str, i32) {
        SIGNAL_TABLE
            .iter()
            .find(|(sig, ..)| *sig == self)
            .unwrap_or(&SIGNAL_TABLE[SIGNAL_TABLE.len() - 1])
    }

    /// Conventional name, e.g. `SIGTERM`
    pub fn name(self) -> &'static str {
        self.entry().1
    }

    /// Name without the `SIG` prefix, e.g. `TERM`
    pub fn short_name(self) -> &'static str {
        self.entry().2
    }

    /// Numeric value on the current platform
    #[cfg(unix)]
    pub fn number(self) -> i32 {
        self.to_nix() as i32
    }

    #[cfg(not(unix))]
    pub fn number(self) -> i32 {
        self.entry().3
    }

    #[cfg(unix)]
    pub fn from_number(number: i32) -> Option<Signal> {
        let native = nix::sys::signal::Signal::try_from(number).ok()?;
        Signal::ALL.into_iter().find(|sig| sig.to_nix() == native)
    }

    #[cfg(not(unix))]
    pub fn from_number(number: i32) -> Option<Signal> {
        SIGNAL_TABLE
            .iter()
            .find(|(.., n)| *n == number)
            .map(|(sig, ..)| *sig)
    }

    #[cfg(unix)]
    pub fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as Native;
        match self {
            Signal::Hup => Native::SIGHUP,
            Signal::Int => Native::SIGINT,
            Signal::Quit => Native::SIGQUIT,
            Signal::Abrt => Native::SIGABRT,
            Signal::Kill => Native::SIGKILL,
            Signal::Usr1 => Native::SIGUSR1,
            Signal::Usr2 => Native::SIGUSR2,
            Signal::Pipe => Native::SIGPIPE,
            Signal::Alrm => Native::SIGALRM,
            Signal::Term => Native::SIGTERM,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Signal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let short = upper.strip_prefix("SIG").unwrap_or(&upper);
        SIGNAL_TABLE
            .iter()
            .find(|(_, _, name, _)| *name == short)
            .map(|(sig, ..)| *sig)
            .ok_or_else(|| Error::invalid(format!("unknown signal '{}'", s)))
    }
}

use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum Error {
    UnknownPackage(String),
    CircularOrMissingDependency { remaining: Vec<String> },
    BuildFailed { package: String, reason: String },
    BuildTimedOut { package: String, timeout: Duration },
    CacheWrite { package: String, reason: String },
    UnsupportedArchitecture(String),
    Config(String),
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    /// Package the error is attributed to, for build-time failures.
    pub fn package(&self) -> Option<&str> {
        match self {
            Self::BuildFailed { package, .. }
            | Self::BuildTimedOut { package, .. }
            | Self::CacheWrite { package, .. } => Some(package),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPackage(name) => write!(f, "unknown package '{name}'"),
            Self::CircularOrMissingDependency { remaining } => write!(
                f,
                "circular or missing dependency; cannot order: {}",
                remaining.join(", ")
            ),
            Self::BuildFailed { package, reason } => {
                write!(f, "build of '{package}' failed: {reason}")
            }
            Self::BuildTimedOut { package, timeout } => write!(
                f,
                "build of '{package}' timed out after {}s",
                timeout.as_secs()
            ),
            Self::CacheWrite { package, reason } => write!(
                f,
                "'{package}' built but its fingerprint could not be recorded (run incomplete): {reason}"
            ),
            Self::UnsupportedArchitecture(arch) => {
                write!(f, "unsupported architecture '{arch}' (supported: arm64)")
            }
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Msg(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_package() {
        let e = Error::UnknownPackage("libfoo".into());
        assert_eq!(e.to_string(), "unknown package 'libfoo'");

        let e = Error::BuildTimedOut {
            package: "opencv".into(),
            timeout: Duration::from_secs(90),
        };
        assert!(e.to_string().contains("'opencv' timed out after 90s"));
        assert_eq!(e.package(), Some("opencv"));
    }
}

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A flag, file, tool or config value is missing or invalid.
    Input,
    /// An external command failed or could not be spawned.
    Command,
    Io,
    Network,
    Cancelled,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Command => "command",
            ErrorKind::Io => "io",
            ErrorKind::Network => "network",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
            source: None,
        }
    }

    pub fn input<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Input, msg)
    }

    pub fn command<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Command, msg)
    }

    pub fn io<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Prefix the message with more context, keeping kind and source.
    pub fn context<M: fmt::Display>(mut self, ctx: M) -> Self {
        self.msg = format!("{ctx}: {}", self.msg);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Kind, message and the whole source chain, one cause per line.
    pub fn detail(&self) -> String {
        let mut out = format!("[{}] {}", self.kind.as_str(), self.msg);
        let mut cur: Option<&(dyn std::error::Error + 'static)> = self
            .source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static));
        while let Some(e) = cur {
            out.push_str(&format!("\n  caused by: {e}"));
            cur = e.source();
        }
        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string()).with_source(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::input(err.to_string()).with_source(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::new(ErrorKind::Network, err.to_string()).with_source(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_includes_kind_and_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = Error::command("dtc failed").with_source(io);
        let d = err.detail();
        assert!(d.starts_with("[command] dtc failed"), "got: {d}");
        assert!(d.contains("caused by: no such file"), "got: {d}");
        assert_eq!(err.to_string(), "dtc failed");
    }

    #[test]
    fn context_keeps_kind() {
        let err = Error::input("missing --board").context("choose-profile");
        assert_eq!(err.kind(), ErrorKind::Input);
        assert_eq!(err.message(), "choose-profile: missing --board");
    }
}

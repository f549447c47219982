//! Engine strings.
//!
//! An engine string selects the backend for a container and carries an
//! optional variant and argument: `engine[+variant]://[argument]`. Examples:
//! `docker://`, `docker+tcp://10.0.0.5:2375`, `kubernetes://myns`,
//! `shell://web`. A bare `docker` is read as `docker://`.

use super::StackError;
use serde::Serialize;
use std::fmt;
use url::Url;

/// Backend family named by an engine string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Inline shell script from the stack's script table
    Shell,
    /// Docker Engine API
    Docker,
    /// Kubernetes API, one pod per container
    Kubernetes,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Shell => write!(f, "shell"),
            EngineKind::Docker => write!(f, "docker"),
            EngineKind::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// A parsed engine string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    /// Backend family
    pub kind: EngineKind,
    /// Text after `+` in the scheme, if any
    pub variant: Option<String>,
    /// Everything after `://`, without a trailing slash
    pub argument: String,
}

impl EngineSpec {
    /// Parse an engine string.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::InvalidEngine`] when the string is not a valid
    /// URI and [`StackError::UnsupportedEngine`] for unknown backends.
    pub fn parse(engine: &str) -> Result<Self, StackError> {
        let engine = engine.trim();
        let normalized = if engine.contains("://") {
            engine.to_string()
        } else {
            format!("{}://", engine)
        };

        let uri = Url::parse(&normalized).map_err(|e| StackError::InvalidEngine {
            engine: engine.to_string(),
            reason: e.to_string(),
        })?;

        let (family, variant) = match uri.scheme().split_once('+') {
            Some((family, variant)) => (family, Some(variant.to_string())),
            None => (uri.scheme(), None),
        };

        let kind = match family {
            "shell" | "script" => EngineKind::Shell,
            "docker" => EngineKind::Docker,
            "kubernetes" | "k8s" => EngineKind::Kubernetes,
            _ => return Err(StackError::UnsupportedEngine(family.to_string())),
        };

        let mut argument = String::new();
        if let Some(host) = uri.host_str() {
            argument.push_str(host);
        }
        if let Some(port) = uri.port() {
            argument.push_str(&format!(":{}", port));
        }
        argument.push_str(uri.path());
        let argument = argument.trim_end_matches('/').to_string();

        Ok(Self {
            kind,
            variant,
            argument,
        })
    }
}

impl fmt::Display for EngineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(variant) = &self.variant {
            write!(f, "+{}", variant)?;
        }
        write!(f, "://{}", self.argument)
    }
}

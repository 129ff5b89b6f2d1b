//! Operation payloads carried by graph vertices.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The operation a vertex performs.
///
/// The set is closed: the scheduler dispatches by matching on the tag.
/// Map-shaped fields use `BTreeMap` so the canonical encoding of a node is
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// Fetch an external artifact (image, git tree, http blob, local dir).
    Source(SourceOp),
    /// Run a command over mounted inputs.
    Exec(ExecOp),
    /// Solve a nested definition read from a file in an input.
    Build(BuildOp),
}

/// Parameters of a source operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOp {
    /// Scheme-tagged identifier, e.g. `docker-image://alpine:3`.
    pub identifier: String,
    /// Scheme-specific attributes (include patterns, keep-git-dir, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

/// Command metadata of an exec operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecMeta {
    /// Argument vector; `args[0]` is the program.
    pub args: Vec<String>,
    /// Environment entries in `KEY=value` form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Working directory inside the rootfs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
}

/// A filesystem binding of an exec operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Index into the vertex inputs this mount is backed by, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<usize>,
    /// Mount target inside the execution environment.
    pub dest: String,
    /// Output slot this mount contributes after the command finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<usize>,
    /// Mount read-only; read-only mounts never produce outputs.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub readonly: bool,
}

/// Parameters of an exec operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOp {
    /// Command to run.
    pub meta: ExecMeta,
    /// Mounts, in declaration order. The rootfs is mount 0.
    pub mounts: Vec<Mount>,
}

/// Parameters of a build operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOp {
    /// Which input holds the nested definition file.
    pub input: usize,
    /// Path of the definition file inside that input.
    pub filename: String,
    /// Builder-specific attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl Op {
    /// Human-readable label used for progress reporting.
    pub fn display_name(&self) -> String {
        match self {
            Op::Source(op) => op.identifier.clone(),
            Op::Exec(op) => op.meta.args.join(" "),
            Op::Build(_) => "build".to_string(),
        }
    }

    /// Declared number of outputs.
    ///
    /// Source and build operations produce exactly one artifact. An exec
    /// operation produces one artifact per output mount, and at least the
    /// rootfs.
    pub fn output_arity(&self) -> usize {
        match self {
            Op::Source(_) | Op::Build(_) => 1,
            Op::Exec(op) => op
                .mounts
                .iter()
                .filter_map(|m| m.output)
                .map(|idx| idx + 1)
                .max()
                .unwrap_or(1),
        }
    }
}

/// A source identifier parsed out of its `scheme://rest` string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceIdentifier {
    /// Container image reference.
    Image(String),
    /// Git remote, with an optional `#ref` fragment.
    Git {
        /// Remote URL or path.
        remote: String,
        /// Branch, tag, or commit requested; default branch when absent.
        reference: Option<String>,
    },
    /// Named local directory transfer.
    Local(String),
    /// HTTP(S) URL, fetched as a single blob.
    Http {
        /// Full URL including the scheme.
        url: String,
        /// Whether the transfer uses TLS.
        tls: bool,
    },
}

/// Failure to parse a source identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSourceIdentifier {
    /// The identifier has no `scheme://` separator.
    #[error("failed to parse source identifier {0:?}")]
    Malformed(String),
    /// The scheme is not one the solver knows about.
    #[error("unknown source scheme {0:?}")]
    UnknownScheme(String),
}

impl SourceIdentifier {
    /// Parse a scheme-tagged identifier string.
    pub fn parse(s: &str) -> Result<Self, InvalidSourceIdentifier> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| InvalidSourceIdentifier::Malformed(s.to_string()))?;
        match scheme {
            "docker-image" => Ok(SourceIdentifier::Image(rest.to_string())),
            "git" => {
                let (remote, reference) = match rest.split_once('#') {
                    Some((remote, fragment)) => (remote, Some(fragment.to_string())),
                    None => (rest, None),
                };
                Ok(SourceIdentifier::Git {
                    remote: remote.to_string(),
                    reference,
                })
            }
            "local" => Ok(SourceIdentifier::Local(rest.to_string())),
            "https" => Ok(SourceIdentifier::Http {
                url: s.to_string(),
                tls: true,
            }),
            "http" => Ok(SourceIdentifier::Http {
                url: s.to_string(),
                tls: false,
            }),
            other => Err(InvalidSourceIdentifier::UnknownScheme(other.to_string())),
        }
    }
}

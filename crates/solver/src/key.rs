//! Cache-key derivation.

use kiln_graph::Digest;
use serde::Serialize;

use crate::error::{Result, SolverError};

/// Fingerprint an operation payload under a type tag.
///
/// The digest covers only the operation itself; input identity is folded in
/// separately by [`vertex_cache_key`].
pub fn op_key<T: Serialize>(type_tag: &str, payload: &T) -> Result<Digest> {
    #[derive(Serialize)]
    struct Tagged<'a, T> {
        #[serde(rename = "type")]
        type_tag: &'a str,
        op: &'a T,
    }
    let raw = serde_json::to_vec(&Tagged { type_tag, op: payload })
        .map_err(|err| SolverError::Internal(format!("serialize op key: {err}")))?;
    Ok(Digest::from_bytes(&raw))
}

/// Combine an operation's own key with its ordered input keys and selectors
/// into the vertex cache key.
///
/// For a vertex with no inputs the result depends only on the operation key.
pub fn vertex_cache_key(op_key: &Digest, inputs: &[(Digest, &str)]) -> Result<Digest> {
    #[derive(Serialize)]
    struct Tuple<'a> {
        op: String,
        inputs: Vec<(String, &'a str)>,
    }
    let tuple = Tuple {
        op: op_key.to_string(),
        inputs: inputs
            .iter()
            .map(|(digest, selector)| (digest.to_string(), *selector))
            .collect(),
    };
    let raw = serde_json::to_vec(&tuple)
        .map_err(|err| SolverError::Internal(format!("serialize key tuple: {err}")))?;
    Ok(Digest::from_bytes(&raw))
}

/// Per-output refinement of a vertex key.
///
/// The refined key is what parents see as their input key and what result
/// entries are stored under.
pub fn output_key(cache_key: &Digest, output_index: usize) -> Digest {
    let mut buf = Vec::with_capacity(80);
    buf.extend_from_slice(cache_key.to_string().as_bytes());
    buf.push(b'@');
    buf.extend_from_slice(output_index.to_string().as_bytes());
    Digest::from_bytes(&buf)
}

//! Serialized graph definitions and the vertex loader.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::op::Op;

/// Errors from decoding or loading a graph definition.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// The definition is malformed: empty, undecodable, cyclic, missing an
    /// input, or selecting an output beyond a parent's arity.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),
    /// A node failed to encode canonically.
    #[error("encode op node: {0}")]
    Encode(String),
}

/// Per-vertex flags supplied alongside the serialized ops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMetadata {
    /// Never satisfy this vertex from cache; it always runs.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignore_cache: bool,
}

/// An input edge of a serialized node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEdge {
    /// Digest of the parent node.
    pub digest: Digest,
    /// Which of the parent's outputs this edge consumes.
    pub output_index: usize,
    /// Per-input filter descriptor; participates in cache identity.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,
}

impl InputEdge {
    /// Edge with an empty selector.
    pub fn new(digest: Digest, output_index: usize) -> Self {
        Self {
            digest,
            output_index,
            selector: String::new(),
        }
    }

    /// Attach a selector to the edge.
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = selector.into();
        self
    }
}

/// Wire form of one graph node: the operation plus its input edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpNode {
    /// Ordered input edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputEdge>,
    /// Operation payload.
    pub op: Op,
}

impl OpNode {
    /// Canonical byte encoding of the node; the digest of these bytes is the
    /// node's identity.
    pub fn to_bytes(&self) -> Result<Bytes, GraphError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| GraphError::Encode(err.to_string()))
    }
}

/// A serialized build graph.
///
/// `ops` is an ordered sequence of canonical node encodings; the last entry
/// is a synthetic root whose single input designates the requested target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Definition {
    /// Canonical node encodings, dependencies before dependents.
    pub ops: Vec<Bytes>,
    /// Per-vertex flags, keyed by node digest.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<Digest, OpMetadata>,
}

impl Definition {
    /// Start assembling a definition.
    pub fn builder() -> DefinitionBuilder {
        DefinitionBuilder::default()
    }
}

/// Incrementally assembles a serialized [`Definition`].
///
/// Nodes are appended dependencies-first; [`DefinitionBuilder::finish`] seals
/// the definition with the synthetic root.
#[derive(Debug, Default)]
pub struct DefinitionBuilder {
    ops: Vec<Bytes>,
    metadata: BTreeMap<Digest, OpMetadata>,
}

impl DefinitionBuilder {
    /// Append a node, returning its digest for use in later edges.
    pub fn add(&mut self, op: Op, inputs: Vec<InputEdge>) -> Result<Digest, GraphError> {
        let raw = OpNode { inputs, op }.to_bytes()?;
        let digest = Digest::from_bytes(&raw);
        self.ops.push(raw);
        Ok(digest)
    }

    /// Mark a node as never cache-satisfiable.
    pub fn ignore_cache(&mut self, digest: Digest) {
        self.metadata.insert(digest, OpMetadata { ignore_cache: true });
    }

    /// Seal the definition with a synthetic root pointing at `target`.
    pub fn finish(mut self, target: Digest, output_index: usize) -> Result<Definition, GraphError> {
        let root = OpNode {
            inputs: vec![InputEdge::new(target, output_index)],
            op: Op::Source(crate::op::SourceOp {
                identifier: String::new(),
                attrs: BTreeMap::new(),
            }),
        };
        self.ops.push(root.to_bytes()?);
        Ok(Definition {
            ops: self.ops,
            metadata: self.metadata,
        })
    }
}

/// A node of the loaded build graph.
///
/// Vertices are structurally shared: within one `load` call, every input
/// edge naming the same digest resolves to the same `Arc`.
#[derive(Debug)]
pub struct Vertex {
    /// Content-addressable identity (digest of the canonical node encoding).
    pub digest: Digest,
    /// Operation payload.
    pub op: Op,
    /// Resolved inputs, in declared order.
    pub inputs: Vec<Input>,
    /// Per-vertex flags.
    pub metadata: OpMetadata,
    /// Human-readable label for progress reporting.
    pub name: String,
}

/// A resolved reference to one output of a parent vertex.
#[derive(Debug, Clone)]
pub struct Input {
    /// Parent vertex.
    pub vertex: Arc<Vertex>,
    /// Which of the parent's outputs this input consumes.
    pub output_index: usize,
    /// Per-input filter descriptor (empty when absent).
    pub selector: String,
}

/// Load a serialized definition into a vertex DAG.
///
/// The synthetic root is stripped; the target vertex and the output index its
/// edge requested are returned.
pub fn load(def: &Definition) -> Result<(Arc<Vertex>, usize), GraphError> {
    if def.ops.is_empty() {
        return Err(GraphError::InvalidDefinition("empty definition".to_string()));
    }

    let mut all_ops: HashMap<Digest, OpNode> = HashMap::with_capacity(def.ops.len());
    let mut last_digest = Digest::from_bytes(&[]);
    for raw in &def.ops {
        let node: OpNode = serde_json::from_slice(raw)
            .map_err(|err| GraphError::InvalidDefinition(format!("undecodable op: {err}")))?;
        last_digest = Digest::from_bytes(raw);
        all_ops.insert(last_digest, node);
    }

    let root = all_ops
        .remove(&last_digest)
        .ok_or_else(|| GraphError::InvalidDefinition("missing root".to_string()))?;
    let edge = root.inputs.first().ok_or_else(|| {
        GraphError::InvalidDefinition("synthetic root has no target input".to_string())
    })?;

    let mut loader = Loader {
        all_ops: &all_ops,
        metadata: &def.metadata,
        built: HashMap::new(),
        visiting: HashSet::new(),
    };
    let target = loader.build(edge.digest)?;
    if edge.output_index >= target.op.output_arity() {
        return Err(GraphError::InvalidDefinition(format!(
            "target output {} exceeds arity {} of {}",
            edge.output_index,
            target.op.output_arity(),
            target.digest,
        )));
    }
    Ok((target, edge.output_index))
}

struct Loader<'a> {
    all_ops: &'a HashMap<Digest, OpNode>,
    metadata: &'a BTreeMap<Digest, OpMetadata>,
    built: HashMap<Digest, Arc<Vertex>>,
    visiting: HashSet<Digest>,
}

impl Loader<'_> {
    fn build(&mut self, digest: Digest) -> Result<Arc<Vertex>, GraphError> {
        if let Some(v) = self.built.get(&digest) {
            return Ok(v.clone());
        }
        if !self.visiting.insert(digest) {
            return Err(GraphError::InvalidDefinition(format!(
                "cycle through {digest}"
            )));
        }

        let node = self.all_ops.get(&digest).ok_or_else(|| {
            GraphError::InvalidDefinition(format!("missing input {digest}"))
        })?;

        let mut inputs = Vec::with_capacity(node.inputs.len());
        for edge in &node.inputs {
            let parent = self.build(edge.digest)?;
            if edge.output_index >= parent.op.output_arity() {
                return Err(GraphError::InvalidDefinition(format!(
                    "input of {digest} selects output {} of {} (arity {})",
                    edge.output_index,
                    parent.digest,
                    parent.op.output_arity(),
                )));
            }
            inputs.push(Input {
                vertex: parent,
                output_index: edge.output_index,
                selector: edge.selector.clone(),
            });
        }
        self.visiting.remove(&digest);

        let vertex = Arc::new(Vertex {
            digest,
            name: node.op.display_name(),
            op: node.op.clone(),
            inputs,
            metadata: self.metadata.get(&digest).copied().unwrap_or_default(),
        });
        self.built.insert(digest, vertex.clone());
        Ok(vertex)
    }
}

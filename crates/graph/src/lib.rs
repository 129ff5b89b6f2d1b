#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Build-graph data model for `kiln`: content digests, operation payloads,
//! and the loader that turns a serialized definition into a vertex DAG.

pub mod def;
pub mod digest;
pub mod op;

pub use def::{
    Definition, DefinitionBuilder, GraphError, Input, InputEdge, OpMetadata, OpNode, Vertex, load,
};
pub use digest::{Digest, DigestParseError};
pub use op::{BuildOp, ExecMeta, ExecOp, InvalidSourceIdentifier, Mount, Op, SourceIdentifier, SourceOp};

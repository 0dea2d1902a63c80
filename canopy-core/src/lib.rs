//! # canopy-core: the state tree contract
//!
//! Everything a canopy replica needs to know about the tree it replicates:
//!
//! - [`path`]: `/`-separated addresses, with `-param-` segments for
//!   "any entry of this collection"
//! - [`reference`]: a path plus the kind of node it targets
//! - [`node`]: navigation over encoded (`serde_json::Value`) nodes
//! - [`driver`]: the [`TreeDriver`] contract drivers implement and compose
//! - [`replica`]: [`TreeReplica`], the in-memory end of a driver chain
//! - [`recording`]: [`RecordingDriver`], a driver that logs its calls

pub mod driver;
pub mod node;
pub mod path;
pub mod recording;
pub mod reference;
pub mod replica;

pub use driver::TreeDriver;
pub use path::{Path, PathError};
pub use recording::{RecordedCall, RecordingDriver};
pub use reference::{Reference, TargetKind};
pub use replica::{TreeError, TreeReplica};

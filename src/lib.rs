//! flowgraph - Lazy dataflow graph engine
//!
//! Operators declare typed input/output slots; slots connect into an
//! acyclic graph. Reads are region-of-interest requests that pull
//! computation on demand; writes invalidate downstream regions without
//! recomputing anything until the next read.

// Engine plumbing (rois, values, signals, executor)
pub mod cancel;
pub mod config;
pub mod error;
pub mod meta;
pub mod request;
pub mod roi;
pub mod signal;
pub mod value;
pub mod workers;

// Graph model
pub mod graph;
pub mod operator;
pub mod operators;
pub mod slot;
pub mod wrapper;

// Re-export the working vocabulary
pub use cancel::{CancellationToken, CancellationTokenSource};
pub use error::GraphError;
pub use graph::Graph;
pub use meta::SlotMeta;
pub use operator::{OpCore, OpCoreBuilder, Operator, attach};
pub use request::{Request, RequestState};
pub use roi::Roi;
pub use signal::{Signal, Subscription};
pub use slot::{DirtyEvent, Slot, SlotDef, SlotRole, StructureEvent, Stype};
pub use value::{ArcArrayD, Dtype, NdValue, Value};
pub use workers::Workers;
pub use wrapper::OperatorWrapper;

// Re-export the stock operators
pub use operators::{OpArrayCache, OpArrayPiper, OpPointwise};

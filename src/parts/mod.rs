//! Pipeline parts: DCP sources, the router/filter connector and XMEM sinks

pub mod dcp;
pub mod router;
pub mod xmem;

pub use dcp::{DcpNozzle, RollbackHandler, VbStreamState};
pub use router::Router;
pub use xmem::{ThroughSeqnoTracker, VbProgress, XmemNozzle};

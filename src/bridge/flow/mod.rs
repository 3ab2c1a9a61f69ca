//! Demand-driven sequences on top of the credit-gated transport.
//!
//! - [`credit`]: the credit counter shared by both adapters.
//! - [`inbound`]: transport pushes become a pull [`Stream`](futures::Stream).
//! - [`single`]: the exactly-one view of an inbound sequence.
//! - [`outbound`]: a pull source drained into the transport on readiness.

pub mod credit;
pub mod inbound;
pub mod outbound;
pub mod single;

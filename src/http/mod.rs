//! Wire format of the Brain service, the [brain::Client] trait that clients implement, and an
//! in-memory model of the service that can be served over HTTP or used in-process.
pub mod brain;

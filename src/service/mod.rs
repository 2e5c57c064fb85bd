//! HTTP integration: tower middleware and the gate server.

mod layer;
mod server;

pub use layer::{AdmissionLayer, AdmissionService};
pub use server::GateServer;

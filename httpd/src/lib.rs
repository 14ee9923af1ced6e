//! Library surface of the control plane binary, split out so integration
//! tests can drive the router without going through a subprocess.

pub mod api;
pub mod state;

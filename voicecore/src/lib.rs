pub mod backoff;
pub mod edge;
pub mod errors;
pub mod mos;
pub mod net;
pub mod protocol;
pub mod reconnect;
pub mod recovery;
pub mod stats;
pub mod types;

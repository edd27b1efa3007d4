mod swarm_error;

pub use swarm_error::{Error, ErrorKind, Result};

//! Custom resource definitions: the Workspace owned by this operator and the
//! third-party resources it manages on the workspace's behalf.

mod postgres;
mod ray;
mod workspace;

pub use postgres::*;
pub use ray::*;
pub use workspace::*;

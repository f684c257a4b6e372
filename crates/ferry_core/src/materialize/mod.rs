pub mod remote;
pub mod tee;

pub use remote::{materialize_remotes, Materialized};
pub use tee::{tee, tee_batches, TeeView};

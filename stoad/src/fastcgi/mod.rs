pub mod codec;
pub mod session;

pub use codec::{Record, RecordHeader};
pub use session::{FcgiSession, WorkerRelay};

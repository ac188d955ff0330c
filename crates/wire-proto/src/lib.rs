#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Manager-worker wire protocol: framing, message grammar, and the
//! recursive file-transfer codec, shared by `manager-core`.

mod codec;
mod error;
mod message;
mod timing;

pub use codec::{receive_tree, Connection};
pub use error::{Result, WireError};
pub use message::{decode_name, encode_name, parse_line, ManagerToWorker, WorkerToManager};
pub use timing::{shaping_delay, RateSample, TransferTimingPolicy};

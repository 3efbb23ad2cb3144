//! Foundation primitives for single-threaded POSIX network daemons: a poll
//! reactor with timer and signal dispatch, a chunked byte buffer with
//! zero-copy access, deadline-aware socket I/O, and a tagged-parameter wire
//! codec.

pub mod buf;
pub mod error;
pub mod msg;
pub mod net;
pub mod pollset;
pub mod reactor;
pub mod sched;
pub mod sigset;
pub mod sorted;
pub mod timespec;

pub use buf::ChunkBuf;
pub use error::{Error, Result};
pub use msg::Msg;
pub use net::NetIo;
pub use pollset::{PollSet, Readiness};
pub use reactor::{Control, Handler, LoopEvent, Reactor};
pub use sched::{Cycles, Event, Scheduler};
pub use sigset::SigSet;
pub use sorted::SortedList;
pub use timespec::TimeSpec;

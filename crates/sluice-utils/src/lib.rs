mod assert;
mod fdmap;
mod sock;
mod thread;
mod time;

pub use fdmap::FdMap;
pub use sock::{set_socket_blocking, set_socket_io_timeout};
pub use thread::{spawn_worker, thread_boot, ThreadPriority};
pub use time::unix_now;

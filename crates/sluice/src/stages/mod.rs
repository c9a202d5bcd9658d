mod poll_in;
mod recycle;
mod write_back;

pub use poll_in::PollInStage;
pub use recycle::RecycleStage;
pub use write_back::WriteBackStage;

pub mod monitor;
pub mod sliding_window;

pub use monitor::{RequestStats, RequestStatsMonitor};
pub use sliding_window::SlidingWindow;

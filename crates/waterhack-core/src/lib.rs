pub mod clock;
pub mod config;

pub use clock::{Clock, ManualClock, SystemClock, epoch_secs};
pub use config::{ControlMode, WaterhackConfig, parse_duration};

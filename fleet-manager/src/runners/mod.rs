//! Unit launchers: simulated devices inside this process, or one worker
//! process per device.

pub mod in_process;
pub mod process;

pub use in_process::InProcessLauncher;
pub use process::ProcessLauncher;

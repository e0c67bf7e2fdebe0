mod accumulator;
mod config;
mod controller;
mod events;
mod state;

pub use accumulator::ElapsedAccumulator;
pub use config::{TimerConfig, DEBUG_ENV};
pub use controller::FocusTimer;
pub use events::{TimerEvent, TimerSnapshot};
pub use state::{TimerPhase, TimerState};

pub mod interruption;
pub mod session;
pub mod task;

pub use interruption::{Interruption, NewInterruption};
pub use session::{FocusSession, SessionStatus};
pub use task::{NewTask, Task, TaskStatus};

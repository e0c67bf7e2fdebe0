mod lifecycle;

pub use lifecycle::{SessionError, SessionLifecycle};

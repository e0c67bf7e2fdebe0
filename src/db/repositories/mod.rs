pub mod interruptions;
pub mod sessions;
pub mod tasks;

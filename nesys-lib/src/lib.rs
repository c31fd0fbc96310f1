pub mod auth;
pub mod blackboard;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod message;
pub mod packet;
pub mod process;
pub mod profile;
pub mod profile_id;
pub mod volume;
pub mod worker;

// Re-export the types most callers need
pub use blackboard::Blackboard;
pub use client::{ConnectionContext, ProfileClient};
pub use config::Settings;
pub use error::NesysError;
pub use profile::CarProfile;
pub use profile_id::ProfileId;
pub use worker::{Worker, WorkerExit, WorkerHandle, WorkerTiming};

//! Posting services
//!
//! - [`registry::PostManagerRegistry`]: entry point, one manager per submission kind
//! - [`manager::PostManager`]: runs one submission against its destinations
//! - [`file_poster::FilePoster`] and [`message_poster::MessagePoster`]: kind-specific posting
//! - [`resume`]: what earlier runs already achieved, folded from the event log
//! - [`events::EventBus`]: live progress notifications

pub mod events;
pub mod file_poster;
pub mod manager;
pub mod message_poster;
pub mod registry;
pub mod resume;

// Re-export commonly used types
pub use events::{EventBus, Notification, NotificationReceiver};
pub use manager::{ManagerSettings, PostManager};
pub use registry::{PostManagerRegistry, RegistrySettings};
pub use resume::ResumeContextBuilder;

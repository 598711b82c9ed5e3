//! `apex-manager`: the host side of the sandbox orchestration core.
//!
//! One [`SandboxManager`] owns every [`Session`]: it drives the cloud
//! platform (create/start/stop/fork/delete, preview URLs, exec, files),
//! installs and restarts the in-sandbox bridge, keeps exactly one
//! WebSocket per sandbox with deduplicated reconnection, exposes the typed
//! command surface, and fans bridge frames out to subscribers as
//! [`ManagerEvent`]s.
//!
//! ```rust,ignore
//! use apex_manager::{ManagerConfig, SandboxManager};
//!
//! let manager = SandboxManager::new(config);
//! let mut events = manager.subscribe();
//! let sandbox_id = manager
//!     .create_sandbox("base-image", Some("Hello World".into()), None)
//!     .await?;
//! let chat = manager
//!     .send_prompt(&sandbox_id, "say hi", None, None, None, None)
//!     .await?;
//! while let Ok(event) = events.recv().await {
//!     // claude_message frames for `chat` arrive here
//! }
//! ```

pub mod connection;
pub mod error;
pub mod events;
pub mod files;
pub mod git;
pub mod layout;
pub mod manager;
pub mod platform;
pub mod reconnect;
pub mod session;
pub mod shell;

pub use error::{ManagerError, Result};
pub use events::ManagerEvent;
pub use manager::{ManagerConfig, SandboxManager};
pub use platform::{PlatformClient, PreviewInfo, SandboxInfo};
pub use session::{Session, SessionStatus};

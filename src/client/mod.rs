//! Device side of notification sync: a durable queue of local changes, the
//! engine that pushes them, and the live socket that receives everyone
//! else's.
pub mod conflict;
pub mod engine;
pub mod queue;
pub mod socket;
pub mod transport;

pub use conflict::{ConflictRecord, ConflictResolver, Resolution};
pub use engine::{SyncEngine, SyncReport, SyncStats};
pub use queue::{ClientStore, LocalNotification, SyncOperation, SyncQueueItem};
pub use socket::{ClientSocket, SocketConfig};
pub use transport::{HttpTransport, SyncTransport};

pub mod record;
pub mod session;
pub mod wire;

pub use record::PeerRecord;
pub use session::{PeerError, PeerSession, PendingHandshake};

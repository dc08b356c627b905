//! PTY engine: session lifecycle and inventory

mod manager;
mod session;

pub use manager::PtyManager;
pub use session::{PtySession, PTY_COLS, PTY_ROWS};

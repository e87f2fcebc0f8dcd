pub mod session;
pub mod session_store;

pub use session::{SessionStorage, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY};
pub use session_store::{FileStore, MemoryStore, NoopStore, SessionStore};

//! Session cookie management: the two named cookie sets, their encrypted
//! on-disk vault, and bootstrap import of browser-exported cookies.

mod bootstrap;
mod cookies;
mod store;

pub use bootstrap::{BootstrapError, import_bootstrap_cookies};
pub use cookies::{CookieRecord, CookieSet};
pub use store::{CookieVault, StoreError, VaultSlot};

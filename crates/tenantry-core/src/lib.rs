pub mod config;
pub mod slug;
pub mod types;

pub use config::TenantryConfig;
pub use slug::{SlugError, TenantSlug};
pub use types::*;

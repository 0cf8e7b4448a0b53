//! Token authentication: the token store and its permission labels.

pub mod permissions;
pub mod tokens;

pub use permissions::PermissionSet;
pub use tokens::{AuthStore, AuthToken, TokenSource};

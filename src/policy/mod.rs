//! Security boundary checks: which peers may submit, which recipients may receive.

pub mod recipient;
pub mod source;

pub use recipient::{PolicyConfig, RecipientPattern};
pub use source::is_trusted_peer;

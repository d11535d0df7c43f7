pub mod identity;

pub use identity::{IdentitySession, IdentityState, IDENTITY_NAMESPACE};

pub mod cancel;
pub mod ids;
pub mod time;

// Foundation crate: small, well-tested primitives only.
pub use cancel::*;
pub use ids::*;
pub use time::*;

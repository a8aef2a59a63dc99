//! View id resolution.

mod router;
mod views;

pub use router::{Router, WILDCARD};
pub use views::ViewRegistry;

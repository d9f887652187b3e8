mod jobs;
mod lease;

pub use jobs::*;
pub use lease::*;

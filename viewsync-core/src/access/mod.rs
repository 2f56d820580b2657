//! Access policy for peer-originated mutations

mod level;
mod path;
mod policy;
mod screen;

pub use level::{combine, AccessLevel};
pub use path::{PathSegment, PropertyPath};
pub use policy::{
    blocking_protectors, check_client_mutation_allowed,
    check_client_mutation_allowed_with_exemptions, computed_level,
};
pub use screen::{screen_incoming, Screened};

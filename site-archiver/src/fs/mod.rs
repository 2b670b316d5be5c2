//! Content-tree access: enumeration, exclusion policy and path containment.

pub mod exclusion;
pub mod paths;
pub mod walker;

pub mod checkpoint;
pub mod constraint;
pub mod generators;
pub mod group;
pub mod selectors;

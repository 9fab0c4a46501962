pub mod meta;
pub mod resource;

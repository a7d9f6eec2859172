pub mod aggregate;
pub mod cache;
pub mod model;
pub mod preprocess;

pub mod apps;
pub mod engine;

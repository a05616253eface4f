pub mod analytics;
pub mod app;
pub mod dedup;
pub mod directory;
pub mod gateway;
pub mod leads;
pub mod prompting;
pub mod signature;
pub mod store;
pub mod types;

pub use app::build_app;

// Session persistence and output naming

pub mod database;
pub mod metadata;

pub use database::{RecordingSummary, SessionStore};
pub use metadata::{reserve_output_path, sanitize_name};

use uuid::Uuid;

pub mod tracked_page;
pub mod extraction_rule;

// Re-exports for convenience
pub use tracked_page::*;
pub use extraction_rule::*;

// Helper function to generate UUIDs in the format expected by the database
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

// Re-export commonly used handler functions for convenience
pub use handlers::{
    SeedSource, collect_status, export_graph, prepare_workspace, query_window, reclaim_all,
    seed_url, seed_urls,
};

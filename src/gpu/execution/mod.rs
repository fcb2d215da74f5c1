pub mod bind_manager;
pub mod binding_layout_manager;
pub mod pipeline_manager;

pub use bind_manager::*;
pub use binding_layout_manager::*;
pub use pipeline_manager::*;

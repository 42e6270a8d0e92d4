pub mod library;
pub mod pipeline;
pub mod screenshot;
pub mod stability;
pub mod template;
pub mod traits;
pub mod types;

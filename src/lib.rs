pub mod config;
pub mod cracker;
pub mod credential;
pub mod export;
pub mod gate;
pub mod graph;
pub mod harvest;
pub mod io;
pub mod render;
pub mod section;
pub mod stage;
pub mod store;

pub mod prelude {
    pub use crate::credential::CredentialRecord;
    pub use crate::graph::PipelineGraph;
    pub use crate::store::HashStore;
}

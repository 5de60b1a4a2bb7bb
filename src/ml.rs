pub mod clustering;
pub mod features;
pub mod hypothesis;
pub mod output;
pub mod pipeline;
pub mod plot;
pub mod reduction;
pub mod stats;
pub mod summary;

mod bridge;
mod config;
mod model;

pub use bridge::GraftBridge;
pub use config::{ComponentConfig, GraftConfig, GrafomerConfig};
pub use model::{GrafomerModel, GrafomerOutput};

mod config;
mod model;

pub use config::BertConfig;
pub use model::BertEncoderModel;

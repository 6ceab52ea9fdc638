mod config;
mod decoder;
mod encoder;

pub use config::{StudentDecoderConfig, StudentEncoderConfig};
pub use decoder::{StudentDecoder, StudentLmModel};
pub use encoder::StudentEncoder;

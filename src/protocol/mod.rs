pub mod codec;
pub mod sequence;

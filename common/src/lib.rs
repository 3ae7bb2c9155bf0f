pub mod channel;
pub mod clip;
pub mod codec;
pub mod config;
pub mod frame;
pub mod keys;
pub mod multipart;
pub mod overlay;

pub mod args;
pub mod op;
pub mod ops;

pub use ops::{Buy, Buying, Config, Init, Keygen, Sell, Selling, Version};

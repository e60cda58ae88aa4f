pub mod exchange;
pub mod mcb;
pub mod pipe;

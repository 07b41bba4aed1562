pub mod error;
pub mod labels;
pub mod setup;
pub mod wait;

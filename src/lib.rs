pub mod cache;
pub mod core;
pub mod datasource;
pub mod export;
pub mod pyramid;
pub mod serve;
pub mod stitch;
pub mod viewport;
pub mod volume;
pub mod zstack;

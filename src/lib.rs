#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod lister;
pub mod mapper;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod transcript;
pub mod ytdlp;

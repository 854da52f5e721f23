pub mod archive;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod output;
pub mod pipeline;
pub mod portal;
pub mod projector;
pub mod reader;
pub mod runner;
pub mod staging;
pub mod taxonomy;
pub mod transform;
pub mod workdir;

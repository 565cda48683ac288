#![forbid(unsafe_code)]

pub mod align;
pub mod build;
pub mod cli;
pub mod crawl;
pub mod dialogue;
pub mod dom;
pub mod fetch;
pub mod formats;
pub mod logging;
pub mod store;
pub mod structure;

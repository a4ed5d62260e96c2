#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate lazy_static;

pub mod downloader;
pub mod ingestor;
pub mod lister;
pub mod manifest;
pub mod rate_limiter;
pub mod records;
pub mod tracking;
pub mod types;
pub mod utils;
pub mod validator;

pub mod cli;
pub mod config;
pub mod dedup;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod source;
pub mod storage;
pub mod watermark;
pub mod web;
pub mod window;

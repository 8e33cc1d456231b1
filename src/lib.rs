pub mod app;
pub mod checksum;
pub mod config;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod fs_util;
pub mod lifecycle;
pub mod log_summary;
pub mod merger;
pub mod output;
pub mod reconcile;
pub mod store;
pub mod transfer;
pub mod workbook;

pub mod compression;
pub mod parquet;
pub mod transcode;

pub mod init;
pub mod judge;
pub mod report;
pub mod validate_config;

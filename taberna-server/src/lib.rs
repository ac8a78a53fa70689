pub mod maintenance;
pub mod server;
pub mod storage;

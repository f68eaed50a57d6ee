pub mod apps;
pub mod coordinator;
pub mod error;
pub mod rpc;
pub mod worker;

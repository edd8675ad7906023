pub mod frame;
pub mod heartbeat;

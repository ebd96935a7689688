pub mod buffer;
pub mod column;
pub mod constants;
pub mod frame;
pub mod handshake;
pub mod packet;
pub mod response;
pub mod row;
pub mod stmt;
pub mod temporal;
pub mod wire;

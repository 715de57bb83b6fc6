//! 面向命令行的操作，统一返回可直接展示的错误字符串

pub mod log;
pub mod sync;
pub mod transfer;

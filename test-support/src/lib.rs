//! 测试支持 crate
//!
//! 提供 Mock 平台实现，用于在宿主机上测试同步原语

#![no_std]

pub mod mock;

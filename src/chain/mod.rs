pub mod contract;
pub mod evm;
pub mod gateway;

pub use evm::{EvmConfig, EvmGateway};
pub use gateway::{ChainGateway, WinnerInfo};

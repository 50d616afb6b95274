use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("block pool must hold at least one block")]
    ZeroBlocks,

    #[error("block size must be non-zero")]
    ZeroBlockSize,
}

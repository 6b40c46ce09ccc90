use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Cache(#[from] driftfs_cache::CacheError),

    #[error(transparent)]
    Store(#[from] driftfs_store::StoreError),

    #[error(transparent)]
    Wal(#[from] driftfs_wal::WalError),

    #[error(transparent)]
    Offload(#[from] driftfs_offload::OffloadError),
}

pub type SdkResult<T> = Result<T, SdkError>;

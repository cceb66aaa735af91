pub mod config;
pub mod error;
pub mod hash;
pub mod model;
pub mod normalizer;
pub mod store;
pub mod sync;
pub mod threading;

pub use config::{
    HealthConfig, IpcConfig, MessagingConfig, NotifyConfig, PlatformsConfig, StorageConfig,
    load_config,
};
pub use error::{
    AuthError, ConfigError, FatalError, IpcError, NormalizationError, ProtocolError,
    StorageError, TransientNetworkError,
};
pub use hash::{CONTENT_HASH_HEX_LEN, blob_hash, hash_prefix, message_content_hash};
pub use model::{
    Account, Author, DaemonState, DaemonStatus, Identity, Message, MessageRefs, MessageSource,
    PlatformState, PlatformStatus, Thread, ThreadSource, ThreadType, kind,
};
pub use normalizer::Normalizer;
pub use store::StateStore;
pub use sync::{SyncStateManager, Watermark};
pub use threading::ThreadingEngine;

//! Keel generation store.
//!
//! Every committed policy is an immutable, numbered generation. Writers serialise through the
//! store's mutation lock; readers get `Arc` snapshots and never wait on writers for longer than a
//! map lookup.
//!
//! Generations, and the actual state the runtime records, are persisted through a
//! [`GenerationBackend`] using a pluggable [`Codec`].

pub mod backend;
pub mod codec;
pub mod error;
pub mod notify;
pub mod store;

pub use backend::{create_backend, FileBackend, GenerationBackend, MemoryBackend};
pub use codec::{
    codec_for, ActualStateDocument, Codec, GenerationDocument, JsonCodec, MsgPackCodec, YamlCodec,
};
pub use error::StoreError;
pub use notify::PolicyChangeNotifier;
pub use store::{
    CommitOutcome, MutationGuard, PolicyData, PolicySnapshot, PolicyStore, SYSTEM_USER,
};

//! GameDock Hub/Agent protocol core.
//! No network I/O policy here: the Agent daemon and Hub client own their
//! sockets; this crate owns the formats and state machines.

pub mod chunk;
pub mod pairing;
pub mod protocol;
pub mod session;
pub mod trust;
pub mod vdf;
pub mod wire;

pub use chunk::{checksum, plan_chunks, verify, ChunkSpec, DEFAULT_CHUNK_SIZE};
pub use pairing::{issue_token, PairingCode, PairingFailure};
pub use protocol::{Envelope, ErrorBody, MessageKind, ProtocolError, PROTOCOL_VERSION};
pub use session::{SessionRegistry, SessionStatus, ThroughputEstimator, UploadSession};
pub use trust::{load_or_create_identity, AuthorizedPeer, TrustStore};
pub use vdf::{derive_app_id, parse_shortcuts, write_shortcuts, Shortcut, VdfError};
pub use wire::{decode_chunk_frame, encode_chunk_frame, ChunkFrame, FrameDecodeError, FrameEncodeError};

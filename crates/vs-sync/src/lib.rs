//! vs-sync: moving metas and chunks between peers of one folder
//!
//! - `messages`: abstract peer protocol (have / request / meta / block)
//! - `remote`: peer handle trait, channel-backed implementation, interest guards
//! - `downloader`: swarm scheduler with weighted chunk queue and block requests
//! - `uploader`: serves blocks and answers interest
//! - `meta_transfer`: meta announcement and retrieval
//! - `folder`: per-folder wiring of index, storage, and transfer components

pub mod downloader;
pub mod folder;
pub mod messages;
pub mod meta_transfer;
pub mod remote;
pub mod uploader;

pub use downloader::{DownloadEvent, Downloader};
pub use folder::FolderGroup;
pub use messages::PeerMessage;
pub use meta_transfer::{MetaDownloader, MetaUploader};
pub use remote::{ChannelRemote, InterestGuard, RemoteFolder, RemoteId};
pub use uploader::Uploader;

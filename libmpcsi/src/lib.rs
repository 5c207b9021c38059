//! # libmpcsi: CSI node plugin backed by Mountpoint Pods
//!
//! `libmpcsi` exposes object-storage buckets to workloads as mounted
//! filesystems.  The bucket itself is mounted by a cluster-scheduled helper
//! pod (a *Mountpoint Pod*); this crate bridges node RPCs to that pod's
//! lifecycle and keeps per-pod mount state consistent across concurrent
//! requests and asynchronous pod updates.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`lock`] | [`MountpointPodLocks`], reference-counted per-pod locks. |
//! | [`mppod`] | Mountpoint Pod observations and the pod [`Watcher`]. |
//! | [`mounter`] | [`PodMounter`] (publish) and [`PodUnmounter`] (reconciliation). |
//! | [`node`] | [`CsiNode`] trait and the [`NodeServer`] request handlers. |
//! | [`identity`] | [`CsiIdentity`] trait, plugin discovery & health. |
//! | [`credential`] | Credentials handed to Mountpoint Pods. |
//! | [`mount`] | Kernel mount capability and mount arguments. |
//! | [`config`] | [`NodeConfig`] and the on-disk layout. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`types`], [`message`], [`error`] | Data model, wire envelope, errors. |

pub mod config;
pub mod credential;
pub mod error;
pub mod identity;
pub mod lock;
pub mod message;
pub mod mount;
pub mod mounter;
pub mod mppod;
pub mod node;
pub mod targetpath;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{MountpointPodPaths, NodeConfig};
pub use error::{CsiError, ErrorCode};
pub use identity::CsiIdentity;
pub use lock::MountpointPodLocks;
pub use message::CsiMessage;
pub use mounter::{Mounter, PodMounter, PodUnmounter, SweepReport};
pub use mppod::{MountpointPod, Watcher};
pub use node::{CsiNode, NodeServer};
pub use types::*;

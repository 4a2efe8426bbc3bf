//! # Meridian Directory
//!
//! The appl-directory sub-protocol for Meridian: publishing and
//! discovering named resources (appls) over an established
//! [`meridian_core::Connection`], and mediating dynamic-resource opens
//! between two peers (including relaying a resource over a
//! directory-selected tunnel channel when a direct connection isn't
//! possible).
//!
//! This crate owns:
//! - [`manager`]: the `DirectorySnapshot`/`DirectoryManager` pair that
//!   tracks a connection's served appl entries, answers `DIRLIST`
//!   requests, emits `DIRSTATE` deltas, sanitizes `DIRDISCOVER` petnames,
//!   and mediates `DIROPEN`/`DIROPENED` exchanges.
//! - [`appl`]: the appl package container format itself — building and
//!   extracting the base64-headered, BLAKE3-hashed, optionally
//!   Ed25519-signed bundle a directory actually serves.
//!
//! `meridian-directory` never touches the outbound arena, cipher, or MAC
//! directly; it only calls the narrow `send_control`-family methods
//! `meridian-core` exposes on [`meridian_core::Connection`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod appl;
pub mod manager;

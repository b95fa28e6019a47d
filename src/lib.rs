//! # reimage
//!
//! A local batch image transcoder. Submitted images are decoded, downscaled
//! to fit a maximum edge, and re-encoded as JPEG, PNG, WebP or AVIF, with
//! per-file progress and zip export. Nothing leaves the machine.
//!
//! # Architecture
//!
//! ```text
//! ingest ──▶ store (pending) ──▶ scheduler ──▶ backend: decode → resize → encode
//!                ▲                   │
//!                └──── artifact / error / progress
//!
//! settings (watch) ──▶ reprocess coordinator ──▶ reset finished → scheduler
//! ```
//!
//! The [`store`] is the single source of truth for per-file state. The
//! [`scheduler`] processes everything pending in fixed-width batches, and the
//! [`reprocess`] coordinator redoes finished files after a settings change,
//! debounced. [`session`] wires these together for the CLI.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`types`] | Shared types: output formats, file ids, submitted sources |
//! | [`config`] | `reimage.toml` loading, merging, validation, presets |
//! | [`imaging`] | Decode, resize, the codec layer and two-tier AVIF |
//! | [`store`] | File records, the status state machine, the processing flag |
//! | [`ingest`] | Submission validation, directory walking, previews |
//! | [`scheduler`] | Batched concurrent processing of pending records |
//! | [`reprocess`] | Debounced reprocessing on settings changes |
//! | [`export`] | Zip or directory export with a JSON report |
//! | [`session`] | The wired-up application and its command language |
//! | [`output`] | CLI formatting for progress events and status |
//!
//! # Design Decisions
//!
//! ## Batches, Not a Pool
//!
//! Pending files are split into consecutive groups of `max_workers` and each
//! group finishes before the next starts. A slow file holds up its batch,
//! but memory stays bounded by the batch width and progress is easy to
//! follow.
//!
//! ## Two AVIF Tiers
//!
//! The `image` crate's encoder is tried first. If it fails, `ravif` is set
//! up once on first use and shared by every later encode. A failed setup is
//! not remembered, so the next AVIF encode tries again.
//!
//! ## Pure-Rust Decoding
//!
//! AVIF is decoded with `avif-parse` and `rav1d`, everything else with the
//! `image` crate. Only lossy WebP encoding links a C library (`libwebp`).

pub mod config;
pub mod export;
pub mod imaging;
pub mod ingest;
pub mod output;
pub mod reprocess;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod types;

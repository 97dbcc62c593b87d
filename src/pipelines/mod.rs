// SPDX-License-Identifier: GPL-3.0-only

//! Processing pipelines
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────────┐     ┌──────────────┐
//! │   Capture    │ ──▶ │    Photo Pipeline     │ ──▶ │ Storage Sink │
//! │ (JPEG / RAW) │     │  - Save queue         │     │  (JPEG/DNG)  │
//! │              │     │  - Transform chain    │     │              │
//! │              │     │  - HDR fusion         │     │              │
//! │              │     │  - EXIF transplant    │     │              │
//! └──────────────┘     └───────────────────────┘     └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`photo`]: Background photo saving and finishing

pub mod photo;

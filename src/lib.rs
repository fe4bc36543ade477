//! android-exe-launcher library.
//!
//! Builds a self-contained "launcher package" (Android's dynamic linker plus
//! the exact library closure of one executable) out of an Android system
//! image, so the executable can run under a user-mode emulator on a plain
//! Linux host:
//!
//! ```text
//! qemu-aarch64 -L <out> -E LD_LIBRARY_PATH=<out>/lib64 ./tool
//! ```
//!
//! Pipeline: [`image`] -> [`elf`] -> [`resolve`] -> [`layout`] -> [`assemble`].

pub mod assemble;
pub mod cache;
pub mod common;
pub mod config;
pub mod elf;
pub mod error;
pub mod image;
pub mod layout;
pub mod manifest;
pub mod preflight;
pub mod process;
pub mod resolve;
pub mod sdk;
pub mod timing;

pub use error::{Error, Result};

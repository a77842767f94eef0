//! Tunestream Core - Networked jukebox engine
//!
//! This crate provides the pieces of a one-song-per-connection audio jukebox:
//! the catalog and its delimited-text codec, the streaming server and client,
//! and the cancellable playback engine with its decoder and audio output.

pub mod catalog;
pub mod client;
pub mod csv;
pub mod decoder;
pub mod output;
pub mod player;
pub mod server;

pub use catalog::{ Catalog, CatalogError };
pub use client::{ ClientError, StreamClient };
pub use decoder::{ PcmFormat, Source };
pub use output::{ AudioDevice, CpalDevice, SinkLine };
pub use player::{ LoopExit, PlaybackEngine, PlaybackError, PlaybackEvent, PlaybackState };
pub use server::{ ServeReport, ServerError, StreamServer };

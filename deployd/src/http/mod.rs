pub mod client;

pub use client::ArtifactClient;

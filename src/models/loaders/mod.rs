pub mod toml_loader;

pub use toml_loader::{load_all_manifests, load_request_manifest, parse_request_manifest};

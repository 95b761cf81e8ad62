//! Our build script.
//!
//! This makes build-time information (version, target, profile)
//! available to the application for the `-version` output.

fn main() {
    built::write_built_file().expect("failed to acquire build-time information");
}

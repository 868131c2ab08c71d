// Build-time identity from Cargo.toml

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Text served on `GET /`.
pub const BANNER: &str = concat!(env!("CARGO_PKG_NAME"), ": QEMU/KVM dashboard");

/// `{ name, version, description }` for `GET /version`.
pub fn info() -> serde_json::Value {
    serde_json::json!({
        "name": NAME,
        "version": VERSION,
        "description": env!("CARGO_PKG_DESCRIPTION"),
    })
}

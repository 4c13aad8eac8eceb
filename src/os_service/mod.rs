//! Hooks for the OS service manager. Only systemd is supported.

mod system;

pub use system::{render_unit, start, status, stop, UnitOptions, SERVICE_NAME};

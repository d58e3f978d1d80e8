//! All Paths are recorded here for use throughout this codebase
pub mod base {
    pub const ROOT: &str = "/";
    pub const HEALTH: &str = "/health";
    pub const ABOUT: &str = "/about";
}

pub mod pubsub {
    pub const PUBLISH: &str = "/publish";
    pub const SUBSCRIBE: &str = "/subscribe";
    pub const UNSUBSCRIBE: &str = "/unsubscribe";
    pub const STATUS: &str = "/status";
    pub const SWITCH_MODE: &str = "/switch_mode";
}

pub fn drop_leading_slash(path: &str) -> &str {
    if let Some(stripped) = path.strip_prefix('/') {
        stripped
    } else {
        path
    }
}

//! All Paths are recorded here for use throughout this codebase
pub mod base {
    pub const ROOT: &str = "/";
    pub const HEALTH: &str = "/health";
    pub const ABOUT: &str = "/about";
}

pub const CLUSTER: &str = "/cluster";

pub mod nodes {
    pub const STATUS: &str = "/nodes/{node_id}";
    pub const FAIL: &str = "/nodes/{node_id}/fail";
    pub const RECOVER: &str = "/nodes/{node_id}/recover";
}

pub fn fail_path(node_id: u32) -> String {
    nodes::FAIL.replace("{node_id}", &node_id.to_string())
}

pub fn recover_path(node_id: u32) -> String {
    nodes::RECOVER.replace("{node_id}", &node_id.to_string())
}

pub fn status_path(node_id: u32) -> String {
    nodes::STATUS.replace("{node_id}", &node_id.to_string())
}

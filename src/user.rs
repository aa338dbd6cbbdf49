use serde::{Deserialize, Serialize};

/// Capabilities attached to a grid user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub name: String,
    /// Priority used for submissions that don't name one
    pub priority: i32,
    pub can_submit_job: bool,
    pub can_kill_other_users_job: bool,
    pub can_start_stop_dispatching: bool,
    pub can_open_close_queue: bool,
    pub can_enable_disable_node: bool,
    pub can_change_autoscaler_settings: bool,
}

impl UserProfile {
    pub fn user() -> Self {
        Self {
            name: "User".to_string(),
            priority: 5,
            can_submit_job: true,
            can_kill_other_users_job: false,
            can_start_stop_dispatching: false,
            can_open_close_queue: false,
            can_enable_disable_node: false,
            can_change_autoscaler_settings: false,
        }
    }

    pub fn admin() -> Self {
        Self {
            name: "Administrator".to_string(),
            priority: 10,
            can_submit_job: true,
            can_kill_other_users_job: true,
            can_start_stop_dispatching: true,
            can_open_close_queue: true,
            can_enable_disable_node: true,
            can_change_autoscaler_settings: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridUser {
    pub user_id: String,
    pub user_name: String,
    pub profile: UserProfile,
}

impl GridUser {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>, profile: UserProfile) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            profile,
        }
    }
}

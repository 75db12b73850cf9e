use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Built-in values for everything outside `plugins.*`.
///
/// Plugin defaults come from the catalog, not from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellDefaults {
    pub url: String,
    #[serde(rename = "window-size")]
    pub window_size: WindowSize,
    #[serde(rename = "window-maximized")]
    pub window_maximized: bool,
    pub options: ShellOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowPosition {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellOptions {
    pub tray: bool,
    pub app_visible: bool,
    pub auto_updates: bool,
    pub always_on_top: bool,
    pub hide_menu: bool,
    pub hide_menu_warned: bool,
    pub start_at_login: bool,
    pub disable_hardware_acceleration: bool,
    pub remove_upgrade_button: bool,
    pub restart_on_config_changes: bool,
    pub auto_reset_app_cache: bool,
    pub resume_on_start: bool,
    pub override_user_agent: bool,
    pub console_enabled: bool,
    pub proxy: String,
    pub themes: Vec<String>,
    pub starting_page: String,
    pub like_buttons: String,
}

impl Default for ShellDefaults {
    fn default() -> Self {
        Self {
            url: "https://music.youtube.com".to_string(),
            window_size: WindowSize {
                width: 1100,
                height: 550,
            },
            window_maximized: false,
            options: ShellOptions::default(),
        }
    }
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            tray: false,
            app_visible: true,
            auto_updates: true,
            always_on_top: false,
            hide_menu: false,
            hide_menu_warned: false,
            start_at_login: false,
            disable_hardware_acceleration: false,
            remove_upgrade_button: false,
            restart_on_config_changes: false,
            auto_reset_app_cache: false,
            resume_on_start: true,
            override_user_agent: false,
            console_enabled: true,
            proxy: String::new(),
            themes: Vec::new(),
            starting_page: String::new(),
            like_buttons: String::new(),
        }
    }
}

impl ShellDefaults {
    /// The defaults as a configuration tree.
    pub fn to_tree(&self) -> Value {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

//! Session rules the server hands to every admitted client.
//!
//! The policy travels inside the handshake response and again whenever the
//! GM changes it.  It is also a section of the server's TOML configuration,
//! which is why every field carries a serde default: a config file written by
//! an older server version still loads.

use serde::{Deserialize, Serialize};

/// Flags controlling what players may see and do during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPolicy {
    /// Players may only move tokens they own.
    #[serde(default)]
    pub strict_token_management: bool,
    /// Token movement is frozen for players.
    #[serde(default)]
    pub movement_locked: bool,
    /// Players may not open the token editor.
    #[serde(default)]
    pub token_editor_locked: bool,
    #[serde(default)]
    pub players_can_reveal_vision: bool,
    #[serde(default)]
    pub gm_reveals_vision_for_unowned_tokens: bool,
    /// Each player sees only what their own tokens see.
    #[serde(default)]
    pub use_individual_views: bool,
    /// Players may only impersonate tokens they own.
    #[serde(default)]
    pub restricted_impersonation: bool,
    #[serde(default)]
    pub players_receive_campaign_macros: bool,
    #[serde(default)]
    pub use_tool_tips_for_default_roll_format: bool,
    /// Fog of war is tracked per player instead of globally.
    #[serde(default)]
    pub use_individual_fow: bool,
    #[serde(default)]
    pub auto_reveal_on_movement: bool,
    /// Owned NPC tokens contribute to fog-of-war views.
    #[serde(default = "default_true")]
    pub include_owned_npcs: bool,
    #[serde(default)]
    pub hide_map_select_ui: bool,
    #[serde(default)]
    pub disable_player_asset_panel: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ServerPolicy {
    fn default() -> Self {
        Self {
            strict_token_management: false,
            movement_locked: false,
            token_editor_locked: false,
            players_can_reveal_vision: false,
            gm_reveals_vision_for_unowned_tokens: false,
            use_individual_views: false,
            restricted_impersonation: false,
            players_receive_campaign_macros: false,
            use_tool_tips_for_default_roll_format: false,
            use_individual_fow: false,
            auto_reveal_on_movement: false,
            include_owned_npcs: default_true(),
            hide_map_select_ui: false,
            disable_player_asset_panel: false,
        }
    }
}

pub mod membership;
pub mod messages;
pub mod notifications;
pub mod presence;
pub mod reactions;

/// Reserved sender identifier for server-originated announcements.
/// Messages from this id bypass the membership guard by design and are
/// delivered as `system_message` events.
pub const SYSTEM_USER_ID: &str = "system";

/// Display name substituted when shaping system messages.
pub const SYSTEM_DISPLAY_NAME: &str = "System";

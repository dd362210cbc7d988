//! Topic namespace.
//!
//! ```text
//! {root}/{plugin}/{field}/set         command
//! {root}/{plugin}/{field}/state       state
//! {root}/{plugin}/{field}/attributes  sensor attributes
//! {root}/{plugin}/{field}/image       image payload
//! {root}/system/{command}/set         system command
//! {root}/status/state                 service status (last will)
//! {prefix}/{component}/{root}/{plugin}_{field}/config   discovery
//! {prefix}/status                     hub birth message
//! ```

use super::EntityKind;

/// Field id of the implicit main enable switch every plugin owns.
pub const MAIN_SWITCH: &str = "switch";
/// Plugin-id segment reserved for system commands.
pub const SYSTEM_SEGMENT: &str = "system";
/// Plugin-id segment reserved for the service status entity.
pub const STATUS_SEGMENT: &str = "status";

const COMMAND_SUFFIX: &str = "set";

/// Root prefix and discovery prefix shared by every topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    root: String,
    discovery_prefix: String,
}

/// A topic recognised by [`Namespace::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicPath<'a> {
    /// `{root}/{owner}/{leaf}/set`.
    Command { owner: &'a str, leaf: &'a str },
    /// `{prefix}/status`.
    HubStatus,
}

impl Namespace {
    pub const DEFAULT_ROOT: &str = "mealiemate";
    pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

    pub fn new(root: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into().trim_matches('/').to_owned(),
            discovery_prefix: discovery_prefix.into().trim_matches('/').to_owned(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn discovery_prefix(&self) -> &str {
        &self.discovery_prefix
    }

    pub fn command_topic(&self, plugin_id: &str, field_id: &str) -> String {
        format!("{}/{plugin_id}/{field_id}/{COMMAND_SUFFIX}", self.root)
    }

    pub fn state_topic(&self, plugin_id: &str, field_id: &str) -> String {
        format!("{}/{plugin_id}/{field_id}/state", self.root)
    }

    pub fn attributes_topic(&self, plugin_id: &str, field_id: &str) -> String {
        format!("{}/{plugin_id}/{field_id}/attributes", self.root)
    }

    pub fn image_topic(&self, plugin_id: &str, field_id: &str) -> String {
        format!("{}/{plugin_id}/{field_id}/image", self.root)
    }

    pub fn discovery_topic(&self, kind: EntityKind, plugin_id: &str, field_id: &str) -> String {
        format!(
            "{}/{}/{}/{plugin_id}_{field_id}/config",
            self.discovery_prefix,
            kind.component(),
            self.root
        )
    }

    pub fn system_command_topic(&self, command: &str) -> String {
        self.command_topic(SYSTEM_SEGMENT, command)
    }

    /// Service status topic; also used as the connection's last will.
    pub fn status_topic(&self) -> String {
        format!("{}/{STATUS_SEGMENT}/state", self.root)
    }

    /// Topic on which the hub announces itself (`online` / `offline`).
    pub fn hub_status_topic(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }

    /// Subscription filter matching every command topic.
    pub fn command_filter(&self) -> String {
        format!("{}/+/+/{COMMAND_SUFFIX}", self.root)
    }

    pub fn unique_id(&self, plugin_id: &str, field_id: &str) -> String {
        format!("{}_{plugin_id}_{field_id}", self.root.replace('/', "_"))
    }

    /// Classify an inbound topic. Returns `None` for anything outside the
    /// namespace or not shaped like a command.
    pub fn parse<'a>(&self, topic: &'a str) -> Option<TopicPath<'a>> {
        if topic == self.hub_status_topic() {
            return Some(TopicPath::HubStatus);
        }
        let rest = topic.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(leaf), Some(COMMAND_SUFFIX), None)
                if !owner.is_empty() && !leaf.is_empty() =>
            {
                Some(TopicPath::Command { owner, leaf })
            }
            _ => None,
        }
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ROOT, Self::DEFAULT_DISCOVERY_PREFIX)
    }
}

/// Identifiers are non-empty runs of `[a-z0-9_]`.
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_layout() {
        let ns = Namespace::default();
        assert_eq!(ns.command_topic("shopping_list", "days"), "mealiemate/shopping_list/days/set");
        assert_eq!(ns.state_topic("shopping_list", "days"), "mealiemate/shopping_list/days/state");
        assert_eq!(
            ns.discovery_topic(EntityKind::Number, "shopping_list", "days"),
            "homeassistant/number/mealiemate/shopping_list_days/config"
        );
        assert_eq!(ns.system_command_topic("rediscover"), "mealiemate/system/rediscover/set");
        assert_eq!(ns.status_topic(), "mealiemate/status/state");
        assert_eq!(ns.hub_status_topic(), "homeassistant/status");
        assert_eq!(ns.command_filter(), "mealiemate/+/+/set");
        assert_eq!(ns.unique_id("meal_planner", "days"), "mealiemate_meal_planner_days");
    }

    #[test]
    fn parse_command_topic() {
        let ns = Namespace::default();
        assert_eq!(
            ns.parse("mealiemate/shopping_list/days/set"),
            Some(TopicPath::Command {
                owner: "shopping_list",
                leaf: "days"
            })
        );
        assert_eq!(ns.parse("homeassistant/status"), Some(TopicPath::HubStatus));
    }

    #[test]
    fn parse_rejects_foreign_and_malformed_topics() {
        let ns = Namespace::default();
        assert_eq!(ns.parse("other/shopping_list/days/set"), None);
        assert_eq!(ns.parse("mealiematex/shopping_list/days/set"), None);
        assert_eq!(ns.parse("mealiemate/shopping_list/days/state"), None);
        assert_eq!(ns.parse("mealiemate/shopping_list/set"), None);
        assert_eq!(ns.parse("mealiemate/shopping_list/days/set/extra"), None);
        assert_eq!(ns.parse("mealiemate//days/set"), None);
    }

    #[test]
    fn custom_namespace_is_trimmed() {
        let ns = Namespace::new("/home/mealiemate/", "ha");
        assert_eq!(ns.command_topic("p", "f"), "home/mealiemate/p/f/set");
        assert_eq!(ns.unique_id("p", "f"), "home_mealiemate_p_f");
        assert_eq!(
            ns.parse("home/mealiemate/p/f/set"),
            Some(TopicPath::Command { owner: "p", leaf: "f" })
        );
    }

    #[test]
    fn identifier_rules() {
        assert!(is_valid_identifier("shopping_list"));
        assert!(is_valid_identifier("v2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("Shopping"));
        assert!(!is_valid_identifier("a/b"));
        assert!(!is_valid_identifier("a-b"));
    }
}

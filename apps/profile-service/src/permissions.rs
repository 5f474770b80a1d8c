use serde::{Deserialize, Serialize};

/// Identity and capability of whoever issued a command, as vouched for by the bot
/// front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: String,
    pub is_admin: bool,
}

impl Requester {
    pub fn member(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_admin: false,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_admin: true,
        }
    }
}

#[must_use]
pub fn can_manage(requester_is_admin: bool, requester_id: &str, target_id: &str) -> bool {
    requester_is_admin || requester_id == target_id
}

#[must_use]
pub fn can_view_all(requester_is_admin: bool) -> bool {
    requester_is_admin
}

#[must_use]
pub fn can_export(requester_is_admin: bool) -> bool {
    requester_is_admin
}

#[cfg(test)]
mod tests {
    use super::{can_export, can_manage, can_view_all};

    #[test]
    fn owners_and_admins_can_manage() {
        assert!(can_manage(false, "42", "42"));
        assert!(can_manage(true, "1", "42"));
        assert!(!can_manage(false, "1", "42"));
        assert!(!can_manage(false, "42", "420"));
    }

    #[test]
    fn listing_and_export_are_admin_only() {
        assert!(can_view_all(true));
        assert!(!can_view_all(false));
        assert!(can_export(true));
        assert!(!can_export(false));
    }
}

//! Permission vocabulary for role-based access control
//!
//! A role grants a set of actions on a subject. Grants are stored as
//! `role_resources` rows (`resource_type` + JSON array of actions) and folded
//! into a [`PermissionSet`] when a request is authorized.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Unknown subject: {0}")]
    UnknownSubject(String),
}

/// Something a user may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    /// Every action, including ones added later
    Manage,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Manage => "manage",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "read" => Ok(Action::Read),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "manage" => Ok(Action::Manage),
            other => Err(PermissionError::UnknownAction(other.to_string())),
        }
    }
}

/// Something a permission applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    User,
    Role,
    Subscription,
    Upload,
    ActivityLog,
    /// Every subject
    All,
}

impl Subject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::User => "user",
            Subject::Role => "role",
            Subject::Subscription => "subscription",
            Subject::Upload => "upload",
            Subject::ActivityLog => "activity_log",
            Subject::All => "all",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subject {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Subject::User),
            "role" => Ok(Subject::Role),
            "subscription" => Ok(Subject::Subscription),
            "upload" => Ok(Subject::Upload),
            "activity_log" => Ok(Subject::ActivityLog),
            "all" => Ok(Subject::All),
            other => Err(PermissionError::UnknownSubject(other.to_string())),
        }
    }
}

/// Actions granted on one subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    #[serde(rename = "resourceType")]
    pub subject: Subject,
    pub actions: Vec<Action>,
}

impl Grant {
    pub fn new(subject: Subject, actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            subject,
            actions: actions.into_iter().collect(),
        }
    }

    /// Parse a stored `role_resources` row
    pub fn from_stored(resource_type: &str, actions: &[String]) -> Result<Self, PermissionError> {
        let subject = resource_type.parse()?;
        let actions = actions
            .iter()
            .map(|a| a.parse())
            .collect::<Result<Vec<Action>, _>>()?;
        Ok(Self { subject, actions })
    }
}

/// Effective permissions of one user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    superuser: bool,
    grants: HashMap<Subject, HashSet<Action>>,
}

impl PermissionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Administrators bypass grant checks entirely
    pub fn superuser() -> Self {
        Self {
            superuser: true,
            grants: HashMap::new(),
        }
    }

    pub fn from_grants(grants: impl IntoIterator<Item = Grant>) -> Self {
        let mut set = Self::empty();
        for grant in grants {
            set.add(grant);
        }
        set
    }

    pub fn add(&mut self, grant: Grant) {
        self.grants
            .entry(grant.subject)
            .or_default()
            .extend(grant.actions);
    }

    pub fn is_superuser(&self) -> bool {
        self.superuser
    }

    /// Check whether `action` is allowed on `subject`
    pub fn can(&self, action: Action, subject: Subject) -> bool {
        if self.superuser {
            return true;
        }

        [subject, Subject::All].iter().any(|s| {
            self.grants
                .get(s)
                .is_some_and(|actions| actions.contains(&Action::Manage) || actions.contains(&action))
        })
    }

    /// Flattened grants, sorted for stable output
    pub fn grants(&self) -> Vec<Grant> {
        let mut grants: Vec<Grant> = self
            .grants
            .iter()
            .map(|(subject, actions)| {
                let mut actions: Vec<Action> = actions.iter().copied().collect();
                actions.sort_by_key(|a| a.as_str());
                Grant::new(*subject, actions)
            })
            .collect();
        grants.sort_by_key(|g| g.subject.as_str());
        grants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_denies_everything() {
        let set = PermissionSet::empty();
        assert!(!set.can(Action::Read, Subject::User));
        assert!(!set.can(Action::Manage, Subject::All));
    }

    #[test]
    fn test_superuser_allows_everything() {
        let set = PermissionSet::superuser();
        assert!(set.can(Action::Delete, Subject::Role));
        assert!(set.can(Action::Manage, Subject::Subscription));
    }

    #[test]
    fn test_specific_action_on_subject() {
        let set = PermissionSet::from_grants([Grant::new(Subject::Upload, [Action::Create])]);
        assert!(set.can(Action::Create, Subject::Upload));
        assert!(!set.can(Action::Delete, Subject::Upload));
        assert!(!set.can(Action::Create, Subject::Role));
    }

    #[test]
    fn test_manage_implies_every_action() {
        let set = PermissionSet::from_grants([Grant::new(Subject::Role, [Action::Manage])]);
        assert!(set.can(Action::Create, Subject::Role));
        assert!(set.can(Action::Delete, Subject::Role));
        assert!(!set.can(Action::Read, Subject::User));
    }

    #[test]
    fn test_all_subject_covers_every_subject() {
        let set = PermissionSet::from_grants([Grant::new(Subject::All, [Action::Read])]);
        assert!(set.can(Action::Read, Subject::ActivityLog));
        assert!(set.can(Action::Read, Subject::Subscription));
        assert!(!set.can(Action::Update, Subject::Subscription));
    }

    #[test]
    fn test_grants_merge_across_roles() {
        let set = PermissionSet::from_grants([
            Grant::new(Subject::User, [Action::Read]),
            Grant::new(Subject::User, [Action::Update]),
        ]);
        assert!(set.can(Action::Read, Subject::User));
        assert!(set.can(Action::Update, Subject::User));
        assert_eq!(set.grants().len(), 1);
        assert_eq!(set.grants()[0].actions, vec![Action::Read, Action::Update]);
    }

    #[test]
    fn test_from_stored_rejects_unknown_values() {
        let ok = Grant::from_stored("upload", &["create".to_string(), "delete".to_string()]);
        assert_eq!(
            ok.unwrap(),
            Grant::new(Subject::Upload, [Action::Create, Action::Delete])
        );

        let bad_subject = Grant::from_stored("invoice", &["read".to_string()]);
        assert_eq!(
            bad_subject.unwrap_err(),
            PermissionError::UnknownSubject("invoice".to_string())
        );

        let bad_action = Grant::from_stored("user", &["publish".to_string()]);
        assert_eq!(
            bad_action.unwrap_err(),
            PermissionError::UnknownAction("publish".to_string())
        );
    }

    #[test]
    fn test_grant_serializes_with_resource_type() {
        let grant = Grant::new(Subject::ActivityLog, [Action::Read]);
        let json = serde_json::to_value(&grant).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "resourceType": "activity_log", "actions": ["read"] })
        );
    }
}

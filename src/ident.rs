//! Author/committer identities and the clock they are stamped with.
//!
//! The core never reads the system clock or an account database directly;
//! commit authorship and ref-log identities come from an [`IdentityProvider`]
//! supplied by the embedding server.

use std::fmt;

use hifitime::Epoch;

/// A person identity as recorded in commit headers: display name, email
/// address and a timestamp in whole Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonIdent {
    pub name: String,
    pub email: String,
    pub when_secs: i64,
}

impl PersonIdent {
    pub fn new(name: impl Into<String>, email: impl Into<String>, when: Epoch) -> Self {
        PersonIdent {
            name: name.into(),
            email: email.into(),
            when_secs: when.to_unix_seconds() as i64,
        }
    }

    /// Same identity restamped at `when`.
    pub fn at(&self, when: Epoch) -> Self {
        PersonIdent {
            name: self.name.clone(),
            email: self.email.clone(),
            when_secs: when.to_unix_seconds() as i64,
        }
    }
}

impl fmt::Display for PersonIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}> {}", self.name, self.email, self.when_secs)
    }
}

/// Source of the acting user, the server identity and the current time.
pub trait IdentityProvider {
    /// Identity of the user on whose behalf the current operation runs.
    fn actor(&self) -> PersonIdent;

    /// The server's own identity, used for committer and ref-log entries
    /// written by background machinery such as the consistency checker.
    fn server(&self) -> PersonIdent;

    fn now(&self) -> Epoch;
}

/// Fixed actor and server identities stamped with the system clock.
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    actor_name: String,
    actor_email: String,
    server_name: String,
    server_email: String,
}

impl SystemIdentity {
    pub fn new(
        actor_name: impl Into<String>,
        actor_email: impl Into<String>,
        server_name: impl Into<String>,
        server_email: impl Into<String>,
    ) -> Self {
        SystemIdentity {
            actor_name: actor_name.into(),
            actor_email: actor_email.into(),
            server_name: server_name.into(),
            server_email: server_email.into(),
        }
    }
}

impl IdentityProvider for SystemIdentity {
    fn actor(&self) -> PersonIdent {
        PersonIdent::new(self.actor_name.clone(), self.actor_email.clone(), self.now())
    }

    fn server(&self) -> PersonIdent {
        PersonIdent::new(self.server_name.clone(), self.server_email.clone(), self.now())
    }

    fn now(&self) -> Epoch {
        // Fails only on platforms without a readable system clock.
        Epoch::now().expect("system time")
    }
}

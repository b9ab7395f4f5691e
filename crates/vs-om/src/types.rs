//! Result codes, forwarder handles and dependency levels.

// ---------------------------------------------------------------------------
// Result code
// ---------------------------------------------------------------------------

/// The outcome of programming one item of state into the forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RcCode {
    /// No result recorded yet.
    #[default]
    Unset,
    /// Nothing has been programmed; not an error.
    Noop,
    /// Forwarder acknowledged the write.
    Ok,
    /// Transient failure; a later replay will re-attempt.
    Retry,
    /// Forwarder rejected the request; the desired state is unachievable.
    Invalid,
    /// The connection dropped while the command was outstanding.
    Timeout,
}

impl RcCode {
    /// Classify a forwarder retval integer.
    pub fn from_retval(retval: i32) -> Self {
        if retval == 0 { RcCode::Ok } else { RcCode::Invalid }
    }

    pub fn is_success(self) -> bool {
        self == RcCode::Ok
    }

    /// Not yet attempted (as opposed to attempted and failed).
    pub fn is_pending(self) -> bool {
        matches!(self, RcCode::Unset | RcCode::Noop)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, RcCode::Retry | RcCode::Invalid | RcCode::Timeout)
    }

    /// True if a replay should re-issue the create for an item in this state:
    /// previously programmed, or lost to a transient failure.  `Invalid` is
    /// surfaced to the caller and never retried automatically.
    pub fn needs_replay(self) -> bool {
        matches!(self, RcCode::Ok | RcCode::Retry | RcCode::Timeout)
    }
}

impl std::fmt::Display for RcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RcCode::Unset => "UNSET",
            RcCode::Noop => "NOOP",
            RcCode::Ok => "OK",
            RcCode::Retry => "RETRY",
            RcCode::Invalid => "INVALID",
            RcCode::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// A forwarder-assigned interface index.
///
/// A handle is only meaningful while the HW item holding it reads `OK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u32);

impl Handle {
    pub const INVALID: Handle = Handle(!0);

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Handle::INVALID
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::INVALID
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "hdl:{}", self.0)
        } else {
            f.write_str("hdl:INVALID")
        }
    }
}

// ---------------------------------------------------------------------------
// Dependency level
// ---------------------------------------------------------------------------

/// Ordering tag for listener dispatch during populate and replay.
///
/// Lower levels are fully dispatched before higher levels begin, so the
/// objects a family references are always materialized first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dependency {
    Bond,
    Interface,
    SubInterface,
    VirtualInterface,
    ForwardingDomain,
    Tunnel,
    Acl,
    Binding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc_classification_is_disjoint() {
        for rc in [
            RcCode::Unset,
            RcCode::Noop,
            RcCode::Ok,
            RcCode::Retry,
            RcCode::Invalid,
            RcCode::Timeout,
        ] {
            let classes =
                [rc.is_pending(), rc.is_success(), rc.is_failure()];
            assert_eq!(
                classes.iter().filter(|c| **c).count(),
                1,
                "{rc} must be in exactly one class"
            );
        }
    }

    #[test]
    fn retval_mapping() {
        assert_eq!(RcCode::from_retval(0), RcCode::Ok);
        assert_eq!(RcCode::from_retval(-1), RcCode::Invalid);
        assert_eq!(RcCode::from_retval(-68), RcCode::Invalid);
    }

    #[test]
    fn invalid_is_never_replayed() {
        assert!(RcCode::Ok.needs_replay());
        assert!(RcCode::Timeout.needs_replay());
        assert!(RcCode::Retry.needs_replay());
        assert!(!RcCode::Invalid.needs_replay());
        assert!(!RcCode::Noop.needs_replay());
    }

    #[test]
    fn handle_sentinel() {
        assert!(!Handle::INVALID.is_valid());
        assert!(Handle(0).is_valid());
        assert_eq!(Handle::default(), Handle::INVALID);
        assert_eq!(Handle(5).to_string(), "hdl:5");
    }

    #[test]
    fn dependency_levels_sort_in_dispatch_order() {
        let mut levels = vec![
            Dependency::Binding,
            Dependency::Tunnel,
            Dependency::Interface,
            Dependency::ForwardingDomain,
        ];
        levels.sort();
        assert_eq!(
            levels,
            vec![
                Dependency::Interface,
                Dependency::ForwardingDomain,
                Dependency::Tunnel,
                Dependency::Binding,
            ]
        );
    }
}
